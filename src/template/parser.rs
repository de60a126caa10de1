//! Template parsing.
//!
//! A template is literal text with embedded `{{ expression }}` spans. The
//! pest grammar lives in `grammar.pest`; this module walks the parse pairs
//! into an owned [`Expr`] tree and caches the set of variable keys each
//! template references directly, which the permutation resolver uses to
//! decide when a string becomes evaluable.

use pest::iterators::Pair;
use pest::Parser as _;
use pest_derive::Parser;

use crate::errors::{ResolveError, Result, ResultExt};
use crate::vars::key::VarKey;

use super::expr::{BinOp, CmpOp, Expr};
use super::functions::FunctionRegistry;
use super::VarLookup;

#[derive(Parser)]
#[grammar = "template/grammar.pest"]
struct TemplateParser;

#[derive(Debug, Clone, PartialEq)]
enum Part {
    Literal(String),
    Expr(Expr),
}

/// A parsed template string.
#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    source: String,
    parts: Vec<Part>,
    refs: Vec<VarKey>,
}

impl Template {
    pub fn parse(text: &str) -> Result<Template> {
        let mut pairs = TemplateParser::parse(Rule::template, text).map_err(|e| {
            ResolveError::structural(format!("could not parse template '{text}'")).caused_by(e)
        })?;

        let template = pairs
            .next()
            .ok_or_else(|| ResolveError::structural("empty template parse"))?;

        let mut parts = Vec::new();
        for pair in template.into_inner() {
            match pair.as_rule() {
                Rule::literal => parts.push(Part::Literal(pair.as_str().to_string())),
                Rule::expr_span => {
                    let inner = first_inner(pair)?;
                    parts.push(Part::Expr(build_expr(inner)?));
                }
                Rule::EOI => {}
                rule => return Err(unexpected(rule)),
            }
        }

        let mut refs = Vec::new();
        for part in &parts {
            if let Part::Expr(expr) = part {
                expr.collect_refs(&mut refs);
            }
        }

        Ok(Template {
            source: text.to_string(),
            parts,
            refs,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Whether this template contains any expression spans at all.
    pub fn has_expressions(&self) -> bool {
        self.parts.iter().any(|p| matches!(p, Part::Expr(_)))
    }

    /// Variable keys referenced directly by this template's expressions.
    pub fn refs(&self) -> &[VarKey] {
        &self.refs
    }

    /// Substitute every expression span with its evaluated value.
    pub fn render(&self, vars: &dyn VarLookup, funcs: &FunctionRegistry) -> Result<String> {
        self.render_inner(vars, funcs)
            .frame_with(|| format!("while resolving '{}'", self.source))
    }

    fn render_inner(&self, vars: &dyn VarLookup, funcs: &FunctionRegistry) -> Result<String> {
        let mut out = String::new();
        for part in &self.parts {
            match part {
                Part::Literal(text) => out.push_str(text),
                Part::Expr(expr) => out.push_str(&expr.eval(vars, funcs)?.render()?),
            }
        }
        Ok(out)
    }
}

fn unexpected(rule: Rule) -> ResolveError {
    ResolveError::structural(format!("unexpected grammar rule {rule:?}"))
}

fn first_inner(pair: Pair<'_, Rule>) -> Result<Pair<'_, Rule>> {
    let rule = pair.as_rule();
    pair.into_inner()
        .next()
        .ok_or_else(|| ResolveError::structural(format!("empty {rule:?} node")))
}

fn build_expr(pair: Pair<'_, Rule>) -> Result<Expr> {
    match pair.as_rule() {
        Rule::expr | Rule::paren => build_expr(first_inner(pair)?),
        Rule::or_expr => build_junction(pair, Rule::or_op),
        Rule::and_expr => build_junction(pair, Rule::and_op),
        Rule::not_expr => build_not(pair),
        Rule::comparison => build_comparison(pair),
        Rule::sum | Rule::product => build_binary_chain(pair),
        Rule::unary => build_unary(pair),
        Rule::atom => build_expr(first_inner(pair)?),
        Rule::float => {
            let text = pair.as_str();
            text.parse::<f64>().map(Expr::Float).map_err(|e| {
                ResolveError::structural(format!("invalid float literal '{text}'")).caused_by(e)
            })
        }
        Rule::integer => {
            let text = pair.as_str();
            text.parse::<i64>().map(Expr::Int).map_err(|e| {
                ResolveError::structural(format!("invalid integer literal '{text}'")).caused_by(e)
            })
        }
        Rule::boolean => Ok(Expr::Bool(pair.as_str() == "True")),
        Rule::string => {
            let inner = first_inner(pair)?;
            Ok(Expr::Str(unescape(inner.as_str())))
        }
        Rule::list => {
            let items = pair
                .into_inner()
                .map(build_expr)
                .collect::<Result<Vec<_>>>()?;
            Ok(Expr::List(items))
        }
        Rule::func_call => {
            let mut inner = pair.into_inner();
            let name = inner
                .next()
                .ok_or_else(|| ResolveError::structural("function call without a name"))?
                .as_str()
                .to_string();
            let args = inner.map(build_expr).collect::<Result<Vec<_>>>()?;
            Ok(Expr::Call { name, args })
        }
        Rule::var_ref => Ok(Expr::Var(VarKey::parse(pair.as_str())?)),
        rule => Err(unexpected(rule)),
    }
}

/// `or_expr` and `and_expr` are flat operand lists separated by their op.
fn build_junction(pair: Pair<'_, Rule>, op_rule: Rule) -> Result<Expr> {
    let mut operands = Vec::new();
    for inner in pair.into_inner() {
        if inner.as_rule() != op_rule {
            operands.push(build_expr(inner)?);
        }
    }
    if operands.len() == 1 {
        return Ok(operands.remove(0));
    }
    Ok(if op_rule == Rule::or_op {
        Expr::Or(operands)
    } else {
        Expr::And(operands)
    })
}

fn build_not(pair: Pair<'_, Rule>) -> Result<Expr> {
    let mut nots = 0usize;
    let mut operand = None;
    for inner in pair.into_inner() {
        if inner.as_rule() == Rule::not_op {
            nots += 1;
        } else {
            operand = Some(build_expr(inner)?);
        }
    }
    let mut expr = operand.ok_or_else(|| ResolveError::structural("'not' without an operand"))?;
    for _ in 0..nots {
        expr = Expr::Not(Box::new(expr));
    }
    Ok(expr)
}

fn build_comparison(pair: Pair<'_, Rule>) -> Result<Expr> {
    let mut inner = pair.into_inner();
    let first = build_expr(
        inner
            .next()
            .ok_or_else(|| ResolveError::structural("empty comparison"))?,
    )?;

    let mut rest = Vec::new();
    let mut pending_op: Option<CmpOp> = None;
    for item in inner {
        if item.as_rule() == Rule::comp_op {
            pending_op = Some(cmp_op(item.as_str())?);
        } else {
            let op = pending_op
                .take()
                .ok_or_else(|| ResolveError::structural("comparison operand without operator"))?;
            rest.push((op, build_expr(item)?));
        }
    }

    if rest.is_empty() {
        Ok(first)
    } else {
        Ok(Expr::Compare {
            first: Box::new(first),
            rest,
        })
    }
}

fn build_binary_chain(pair: Pair<'_, Rule>) -> Result<Expr> {
    let mut inner = pair.into_inner();
    let mut expr = build_expr(
        inner
            .next()
            .ok_or_else(|| ResolveError::structural("empty arithmetic expression"))?,
    )?;

    let mut pending_op: Option<BinOp> = None;
    for item in inner {
        match item.as_rule() {
            Rule::add_op | Rule::mul_op => pending_op = Some(bin_op(item.as_str())?),
            _ => {
                let op = pending_op
                    .take()
                    .ok_or_else(|| ResolveError::structural("operand without operator"))?;
                expr = Expr::Binary {
                    op,
                    lhs: Box::new(expr),
                    rhs: Box::new(build_expr(item)?),
                };
            }
        }
    }
    Ok(expr)
}

fn build_unary(pair: Pair<'_, Rule>) -> Result<Expr> {
    let mut negations = 0usize;
    let mut operand = None;
    for inner in pair.into_inner() {
        if inner.as_rule() == Rule::sign {
            if inner.as_str() == "-" {
                negations += 1;
            }
        } else {
            operand = Some(build_expr(inner)?);
        }
    }
    let mut expr = operand.ok_or_else(|| ResolveError::structural("sign without an operand"))?;
    if negations % 2 == 1 {
        expr = Expr::Neg(Box::new(expr));
    }
    Ok(expr)
}

fn bin_op(text: &str) -> Result<BinOp> {
    Ok(match text {
        "+" => BinOp::Add,
        "-" => BinOp::Sub,
        "*" => BinOp::Mul,
        "/" => BinOp::Div,
        "//" => BinOp::FloorDiv,
        "%" => BinOp::Mod,
        other => return Err(ResolveError::structural(format!("unknown operator '{other}'"))),
    })
}

fn cmp_op(text: &str) -> Result<CmpOp> {
    Ok(match text {
        "==" => CmpOp::Eq,
        "!=" => CmpOp::Ne,
        "<" => CmpOp::Lt,
        "<=" => CmpOp::Le,
        ">" => CmpOp::Gt,
        ">=" => CmpOp::Ge,
        other => {
            return Err(ResolveError::structural(format!(
                "unknown comparison operator '{other}'"
            )))
        }
    })
}

fn unescape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some('n') => out.push('\n'),
                Some('t') => out.push('\t'),
                Some(other) => out.push(other),
                None => out.push('\\'),
            }
        } else {
            out.push(c);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use crate::template::build_default_function_registry;

    use super::*;

    /// A flat key -> value lookup for expression tests.
    struct FlatVars(HashMap<String, String>);

    impl FlatVars {
        fn new(pairs: &[(&str, &str)]) -> FlatVars {
            FlatVars(
                pairs
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            )
        }
    }

    impl VarLookup for FlatVars {
        fn lookup(&self, key: &VarKey) -> Result<String> {
            self.0
                .get(&key.to_string())
                .cloned()
                .ok_or_else(|| ResolveError::reference(key.to_string(), "not defined"))
        }
    }

    fn render(text: &str, vars: &[(&str, &str)]) -> Result<String> {
        let funcs = build_default_function_registry();
        Template::parse(text)?.render(&FlatVars::new(vars), &funcs)
    }

    #[test]
    fn plain_text_passes_through() {
        assert_eq!(render("echo hello", &[]).unwrap(), "echo hello");
        assert_eq!(render("", &[]).unwrap(), "");
        assert!(!Template::parse("no exprs here").unwrap().has_expressions());
    }

    #[test]
    fn literal_spacing_is_preserved() {
        assert_eq!(
            render("echo {{foo}}  {{bar}}", &[("foo", "a"), ("bar", "b")]).unwrap(),
            "echo a  b"
        );
    }

    #[test]
    fn arithmetic_and_precedence() {
        assert_eq!(render("{{ 1 + 2 * 3 }}", &[]).unwrap(), "7");
        assert_eq!(render("{{ (1 + 2) * 3 }}", &[]).unwrap(), "9");
        assert_eq!(render("{{ 7 // 2 }}", &[]).unwrap(), "3");
        assert_eq!(render("{{ -7 // 2 }}", &[]).unwrap(), "-4");
        assert_eq!(render("{{ 7 % 3 }}", &[]).unwrap(), "1");
        assert_eq!(render("{{ 1 / 2 }}", &[]).unwrap(), "0.5");
        assert_eq!(render("{{ 4 / 2 }}", &[]).unwrap(), "2.0");
        assert_eq!(render("{{ - 3 + 5 }}", &[]).unwrap(), "2");
    }

    #[test]
    fn chained_comparisons() {
        assert_eq!(render("{{ 1 < 2 }}", &[]).unwrap(), "True");
        assert_eq!(render("{{ 1 < 2 < 3 }}", &[]).unwrap(), "True");
        assert_eq!(render("{{ 1 < 3 < 2 }}", &[]).unwrap(), "False");
        assert_eq!(render("{{ 2 == 2.0 }}", &[]).unwrap(), "True");
        assert_eq!(render("{{ \"a\" < \"b\" }}", &[]).unwrap(), "True");
    }

    #[test]
    fn boolean_logic_and_keywords() {
        assert_eq!(render("{{ True and False }}", &[]).unwrap(), "False");
        assert_eq!(render("{{ True or False }}", &[]).unwrap(), "True");
        assert_eq!(render("{{ not False }}", &[]).unwrap(), "True");
        // A variable named like a keyword prefix still parses.
        assert_eq!(render("{{ nothing }}", &[("nothing", "x")]).unwrap(), "x");
    }

    #[test]
    fn variable_coercion_in_arithmetic() {
        assert_eq!(render("{{ n + 1 }}", &[("n", "41")]).unwrap(), "42");
        assert_eq!(render("{{ f * 2 }}", &[("f", "1.5")]).unwrap(), "3.0");
        assert_eq!(
            render("{{ s + \"!\" }}", &[("s", "hey")]).unwrap(),
            "hey!"
        );
    }

    #[test]
    fn function_calls() {
        assert_eq!(render("{{ min(3, 2) }}", &[]).unwrap(), "2");
        assert_eq!(render("{{ sum([1, 2, 3]) }}", &[]).unwrap(), "6");
        assert_eq!(render("{{ len(\"abc\") }}", &[]).unwrap(), "3");
        assert_eq!(render("{{ floor(5 / 2) }}", &[]).unwrap(), "2");
    }

    #[test]
    fn refs_are_collected_and_deduped() {
        let tmpl = Template::parse("{{a}} {{ b.c + a }} {{ sys.d.0.e }}").unwrap();
        let refs: Vec<String> = tmpl.refs().iter().map(|k| k.to_string()).collect();
        assert_eq!(refs, vec!["a", "b.c", "sys.d.0.e"]);
    }

    #[test]
    fn malformed_templates_fail() {
        assert!(Template::parse("{{ unclosed").is_err());
        assert!(Template::parse("{{ 1 + }}").is_err());
        assert!(Template::parse("{{ a..b }}").is_err());
    }

    #[test]
    fn missing_variable_is_a_reference_error() {
        let err = render("{{ ghost }}", &[]).unwrap_err();
        assert_eq!(err.kind().category(), "reference");
    }
}
