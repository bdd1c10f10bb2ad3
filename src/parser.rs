//! Expression parser using nom.
//!
//! Parses the djaq expression language into an [`Expr`] tree.
//!
//! # Syntax Overview
//!
//! ```text
//! name, publisher.name as publisher, avg(price) as avg_price
//! ────  ──────────────┬───────────── ───────────┬───────────
//!  │                  │                         └── function call, explicit alias
//!  │                  └── attribute path, explicit alias
//!  └── plain column, alias derived from the expression
//! ```
//!
//! Precedence, loosest first: `or`, `and`, `not`, comparisons
//! (`== != <> < <= > >=`, `is`, `is not`, `in`, `not in`), `+ -`, `* / %`,
//! unary `- +`.

use nom::{
    branch::alt,
    bytes::complete::{tag, tag_no_case, take_while1},
    character::complete::{alpha1, alphanumeric1, char, digit1, multispace0, multispace1, one_of, satisfy},
    combinator::{map, not, opt, recognize, value, verify},
    error::{Error, ErrorKind},
    multi::{many0, many0_count, separated_list0, separated_list1},
    sequence::{delimited, pair, preceded, terminated, tuple},
    IResult,
};
use regex::Regex;
use std::sync::OnceLock;

use crate::ast::*;
use crate::error::{DjaqError, DjaqResult};

const RESERVED: &[&str] = &["and", "or", "not", "in", "is", "true", "false", "none", "null"];

/// Parse a complete expression.
pub fn parse_expression(source: &str) -> DjaqResult<Expr> {
    let input = source.trim();

    match parse_or(input) {
        Ok((rest, expr)) if rest.trim().is_empty() => Ok(expr),
        Ok((rest, _)) => Err(DjaqError::parse(
            input.len() - rest.trim_start().len(),
            format!("Unexpected trailing content: '{}'", rest.trim()),
        )),
        Err(e) => Err(DjaqError::parse(error_position(input, &e), format!("Parse failed: {}", e))),
    }
}

/// Split a column list into expressions and aliases.
///
/// Commas nested in brackets or strings do not split. `expr as alias` sets
/// the alias explicitly, otherwise it is derived with [`slugify_alias`].
pub fn parse_columns(source: &str) -> DjaqResult<Vec<ColumnSource>> {
    let source = strip_enclosing_parens(source.trim())?;
    let mut columns = Vec::new();

    for part in split_top_level(source)? {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let column = match alias_pattern().captures(part) {
            Some(caps) => ColumnSource {
                expression: caps[1].trim().to_string(),
                alias: caps[2].to_string(),
            },
            None => {
                let mut alias = slugify_alias(part);
                if alias.is_empty() {
                    alias = format!("col{}", columns.len());
                }
                ColumnSource {
                    expression: part.to_string(),
                    alias,
                }
            }
        };
        if columns.iter().any(|c: &ColumnSource| c.alias == column.alias) {
            return Err(DjaqError::InvalidExpression(format!(
                "duplicate column alias '{}'",
                column.alias
            )));
        }
        columns.push(column);
    }
    Ok(columns)
}

/// Parse an ORDER BY source: `name, -price, pubdate desc`.
pub fn parse_order_by(source: &str) -> DjaqResult<Vec<OrderTerm>> {
    let source = strip_enclosing_parens(source.trim())?;
    if source.is_empty() {
        return Ok(Vec::new());
    }

    let terms = match separated_list1(
        tuple((multispace0, char(','), multispace0)),
        parse_order_term,
    )(source)
    {
        Ok((rest, terms)) if rest.trim().is_empty() => terms,
        Ok((rest, _)) => {
            return Err(DjaqError::InvalidExpression(format!(
                "bad order-by term near '{}'",
                rest.trim()
            )));
        }
        Err(e) => {
            return Err(DjaqError::InvalidExpression(format!("bad order-by '{}': {}", source, e)));
        }
    };

    terms
        .into_iter()
        .map(|(expr, direction)| {
            let (expr, negated) = match expr {
                Expr::Unary {
                    op: UnaryOp::Neg,
                    operand,
                } => (*operand, true),
                other => (other, false),
            };
            match (negated, direction) {
                (true, Some(false)) => Err(DjaqError::InvalidExpression(
                    "'-' prefix conflicts with 'asc'".to_string(),
                )),
                (negated, direction) => Ok(OrderTerm {
                    expr,
                    descending: negated || direction == Some(true),
                }),
            }
        })
        .collect()
}

/// Derive a column alias from expression text: dots and spaces become
/// underscores, then everything but word characters is dropped.
pub fn slugify_alias(expression: &str) -> String {
    static NON_WORD: OnceLock<Regex> = OnceLock::new();
    static DASHES: OnceLock<Regex> = OnceLock::new();
    let non_word = NON_WORD.get_or_init(|| Regex::new(r"[^\w\s-]").expect("slug pattern"));
    let dashes = DASHES.get_or_init(|| Regex::new(r"[-\s]+").expect("slug pattern"));

    let text = expression.replace('.', "_").replace(' ', "_").to_lowercase();
    let text = non_word.replace_all(&text, "");
    let text = dashes.replace_all(&text, "-");
    text.trim_matches(|c| c == '-' || c == '_').replace('-', "_")
}

fn alias_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"(?is)^(.*\S)\s+as\s+(\w+)$").expect("alias pattern"))
}

fn error_position(input: &str, err: &nom::Err<nom::error::Error<&str>>) -> usize {
    match err {
        nom::Err::Error(e) | nom::Err::Failure(e) => input.len() - e.input.len(),
        nom::Err::Incomplete(_) => input.len(),
    }
}

/// Split on commas at bracket depth zero, outside string literals.
fn split_top_level(source: &str) -> DjaqResult<Vec<&str>> {
    let mut parts = Vec::new();
    let mut depth: i32 = 0;
    let mut quote: Option<char> = None;
    let mut start = 0;

    for (i, c) in source.char_indices() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '\'' | '"') => quote = Some(c),
            (None, '(' | '[' | '{') => depth += 1,
            (None, ')' | ']' | '}') => {
                depth -= 1;
                if depth < 0 {
                    return Err(unbalanced(source));
                }
            }
            (None, ',') if depth == 0 => {
                parts.push(&source[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    if depth != 0 || quote.is_some() {
        return Err(unbalanced(source));
    }
    parts.push(&source[start..]);
    Ok(parts)
}

/// Remove one pair of parentheses that encloses the whole source.
fn strip_enclosing_parens(source: &str) -> DjaqResult<&str> {
    if !source.starts_with('(') || !source.ends_with(')') {
        return Ok(source);
    }
    let mut depth = 0;
    let mut quote: Option<char> = None;
    for (i, c) in source.char_indices() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '\'' | '"') => quote = Some(c),
            (None, '(') => depth += 1,
            (None, ')') => {
                depth -= 1;
                if depth == 0 {
                    return if i == source.len() - 1 {
                        Ok(source[1..i].trim())
                    } else {
                        Ok(source)
                    };
                }
            }
            _ => {}
        }
    }
    Err(unbalanced(source))
}

fn unbalanced(source: &str) -> DjaqError {
    DjaqError::InvalidExpression(format!("unbalanced brackets or quotes in '{}'", source))
}

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

/// Case-insensitive keyword that is not the prefix of a longer identifier.
fn keyword<'a>(word: &'static str) -> impl FnMut(&'a str) -> IResult<&'a str, &'a str> {
    terminated(tag_no_case(word), not(satisfy(is_ident_char)))
}

fn parse_order_term(input: &str) -> IResult<&str, (Expr, Option<bool>)> {
    let (input, expr) = parse_or(input)?;
    let (input, direction) = opt(preceded(
        multispace1,
        alt((value(true, keyword("desc")), value(false, keyword("asc")))),
    ))(input)?;
    Ok((input, (expr, direction)))
}

/// Parse `or` chains (lowest precedence).
fn parse_or(input: &str) -> IResult<&str, Expr> {
    let (input, first) = parse_and(input)?;
    parse_logical_chain(input, first, parse_and, "or", LogicalOp::Or)
}

/// Parse `and` chains.
fn parse_and(input: &str) -> IResult<&str, Expr> {
    let (input, first) = parse_not(input)?;
    parse_logical_chain(input, first, parse_not, "and", LogicalOp::And)
}

/// Collect `first kw operand kw operand ...` into one n-ary node.
fn parse_logical_chain<'a>(
    mut input: &'a str,
    first: Expr,
    parse_operand: fn(&'a str) -> IResult<&'a str, Expr>,
    word: &'static str,
    op: LogicalOp,
) -> IResult<&'a str, Expr> {
    let mut operands = vec![first];

    loop {
        let (remaining, _) = multispace0(input)?;
        match keyword(word)(remaining) {
            Ok((after_op, _)) => {
                let (after_ws, _) = multispace0(after_op)?;
                let (after_operand, operand) = parse_operand(after_ws)?;
                operands.push(operand);
                input = after_operand;
            }
            Err(_) => break,
        }
    }

    if operands.len() == 1 {
        Ok((input, operands.remove(0)))
    } else {
        Ok((input, Expr::Logical { op, operands }))
    }
}

fn parse_not(input: &str) -> IResult<&str, Expr> {
    alt((
        map(
            preceded(pair(keyword("not"), multispace0), parse_not),
            |operand| Expr::Unary {
                op: UnaryOp::Not,
                operand: Box::new(operand),
            },
        ),
        parse_comparison,
    ))(input)
}

fn parse_comparison(input: &str) -> IResult<&str, Expr> {
    let (after_left, left) = parse_additive(input)?;
    let (remaining, _) = multispace0(after_left)?;

    match parse_compare_op(remaining) {
        Ok((after_op, op)) => {
            let (after_ws, _) = multispace0(after_op)?;
            let (after_right, right) = parse_additive(after_ws)?;
            Ok((
                after_right,
                Expr::Compare {
                    op,
                    left: Box::new(left),
                    right: Box::new(right),
                },
            ))
        }
        Err(_) => Ok((after_left, left)),
    }
}

fn parse_compare_op(input: &str) -> IResult<&str, CompareOp> {
    alt((
        value(CompareOp::Eq, tag("==")),
        value(CompareOp::NotEq, tag("!=")),
        value(CompareOp::NotEq, tag("<>")),
        value(CompareOp::LtE, tag("<=")),
        value(CompareOp::GtE, tag(">=")),
        value(CompareOp::Lt, tag("<")),
        value(CompareOp::Gt, tag(">")),
        value(CompareOp::Eq, tag("=")),
        value(
            CompareOp::IsNot,
            tuple((keyword("is"), multispace1, keyword("not"))),
        ),
        value(CompareOp::Is, keyword("is")),
        value(
            CompareOp::NotIn,
            tuple((keyword("not"), multispace1, keyword("in"))),
        ),
        value(CompareOp::In, keyword("in")),
    ))(input)
}

/// Parse additive: expr + expr, expr - expr
fn parse_additive(input: &str) -> IResult<&str, Expr> {
    let (input, left) = parse_multiplicative(input)?;
    parse_binary_chain(
        input,
        left,
        parse_multiplicative,
        &[("+", BinaryOp::Add), ("-", BinaryOp::Sub)],
    )
}

/// Parse multiplicative: expr * expr, expr / expr, expr % expr
fn parse_multiplicative(input: &str) -> IResult<&str, Expr> {
    let (input, left) = parse_unary(input)?;
    parse_binary_chain(
        input,
        left,
        parse_unary,
        &[
            ("*", BinaryOp::Mul),
            ("/", BinaryOp::Div),
            ("%", BinaryOp::Mod),
        ],
    )
}

/// Generic left-associative binary chain parser
fn parse_binary_chain<'a>(
    mut input: &'a str,
    mut left: Expr,
    parse_operand: fn(&'a str) -> IResult<&'a str, Expr>,
    operators: &[(&str, BinaryOp)],
) -> IResult<&'a str, Expr> {
    loop {
        let (remaining, _) = multispace0(input)?;

        let mut matched = None;
        for (op_str, op_enum) in operators {
            if let Ok((after_op, _)) = tag::<_, _, nom::error::Error<&str>>(*op_str)(remaining) {
                matched = Some((after_op, *op_enum));
                break;
            }
        }

        let Some((after_op, op)) = matched else {
            break;
        };
        let (after_ws, _) = multispace0(after_op)?;
        let (after_right, right) = parse_operand(after_ws)?;
        left = Expr::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        };
        input = after_right;
    }

    Ok((input, left))
}

fn parse_unary(input: &str) -> IResult<&str, Expr> {
    alt((
        map(preceded(pair(char('-'), multispace0), parse_unary), |operand| {
            Expr::Unary {
                op: UnaryOp::Neg,
                operand: Box::new(operand),
            }
        }),
        map(preceded(pair(char('+'), multispace0), parse_unary), |operand| {
            Expr::Unary {
                op: UnaryOp::Pos,
                operand: Box::new(operand),
            }
        }),
        parse_primary,
    ))(input)
}

fn parse_primary(input: &str) -> IResult<&str, Expr> {
    alt((
        parse_grouped,
        parse_list,
        parse_placeholder,
        parse_string,
        parse_number,
        parse_constant,
        parse_call_or_path,
    ))(input)
}

/// Comma separated expressions, reporting whether a trailing comma followed.
fn parse_sequence(input: &str) -> IResult<&str, (Vec<Expr>, bool)> {
    let (input, items) = separated_list0(tuple((multispace0, char(','), multispace0)), parse_or)(input)?;
    let (input, trailing) = opt(pair(multispace0, char(',')))(input)?;
    Ok((input, (items, trailing.is_some())))
}

/// `(expr)` groups, `(a, b)` and `(a,)` are tuples.
fn parse_grouped(input: &str) -> IResult<&str, Expr> {
    let (input, (mut items, trailing)) = delimited(
        pair(char('('), multispace0),
        parse_sequence,
        pair(multispace0, char(')')),
    )(input)?;

    if items.len() == 1 && !trailing {
        Ok((input, items.remove(0)))
    } else {
        Ok((input, Expr::Tuple(items)))
    }
}

fn parse_list(input: &str) -> IResult<&str, Expr> {
    map(
        delimited(
            pair(char('['), multispace0),
            parse_sequence,
            pair(multispace0, char(']')),
        ),
        |(items, _)| Expr::List(items),
    )(input)
}

fn parse_placeholder(input: &str) -> IResult<&str, Expr> {
    map(
        delimited(char('{'), take_while1(is_ident_char), char('}')),
        |name: &str| Expr::Placeholder(name.to_string()),
    )(input)
}

fn quoted<'a>(quote: char) -> impl FnMut(&'a str) -> IResult<&'a str, String> {
    move |input: &'a str| {
        let (mut rest, _) = char(quote)(input)?;
        let mut text = String::new();
        loop {
            let mut chars = rest.chars();
            match chars.next() {
                None => return Err(nom::Err::Error(Error::new(rest, ErrorKind::Char))),
                Some(c) if c == quote => {
                    if chars.next() == Some(quote) {
                        text.push(quote);
                        rest = &rest[2..];
                        continue;
                    }
                    return Ok((&rest[1..], text));
                }
                // only the quote and the backslash itself are escapable
                Some('\\') => match chars.next() {
                    Some(n) if n == quote || n == '\\' => {
                        text.push(n);
                        rest = &rest[2..];
                    }
                    _ => {
                        text.push('\\');
                        rest = &rest[1..];
                    }
                },
                Some(c) => {
                    text.push(c);
                    rest = &rest[c.len_utf8()..];
                }
            }
        }
    }
}

/// String literal; a string holding only `{name}` is that placeholder.
fn parse_string(input: &str) -> IResult<&str, Expr> {
    let (input, text) = alt((quoted('\''), quoted('"')))(input)?;

    if let Ok(("", placeholder)) = parse_placeholder(&text) {
        return Ok((input, placeholder));
    }
    Ok((input, Expr::Literal(Literal::Str(text))))
}

fn parse_number(input: &str) -> IResult<&str, Expr> {
    map(
        recognize(tuple((
            digit1,
            opt(pair(char('.'), digit1)),
            opt(tuple((one_of("eE"), opt(one_of("+-")), digit1))),
        ))),
        |n: &str| Expr::Literal(Literal::Number(n.to_string())),
    )(input)
}

fn parse_constant(input: &str) -> IResult<&str, Expr> {
    alt((
        value(Expr::Literal(Literal::Bool(true)), keyword("true")),
        value(Expr::Literal(Literal::Bool(false)), keyword("false")),
        value(Expr::Literal(Literal::Null), keyword("none")),
        value(Expr::Literal(Literal::Null), keyword("null")),
    ))(input)
}

/// Identifier that is not a reserved word.
fn parse_name(input: &str) -> IResult<&str, &str> {
    verify(
        recognize(pair(
            alt((alpha1, tag("_"))),
            many0_count(alt((alphanumeric1, tag("_")))),
        )),
        |s: &str| !RESERVED.contains(&s.to_ascii_lowercase().as_str()),
    )(input)
}

fn parse_call_args(input: &str) -> IResult<&str, Vec<Expr>> {
    delimited(
        pair(char('('), multispace0),
        alt((
            map(terminated(char('*'), multispace0), |_| vec![Expr::Star]),
            map(parse_sequence, |(items, _)| items),
        )),
        pair(multispace0, char(')')),
    )(input)
}

/// Function call `name(args)` or dotted path `a.b.c`.
fn parse_call_or_path(input: &str) -> IResult<&str, Expr> {
    let (input, first) = parse_name(input)?;

    if let Ok((rest, args)) = parse_call_args(input) {
        return Ok((
            rest,
            Expr::Call {
                name: first.to_string(),
                args,
            },
        ));
    }

    let (input, rest) = many0(preceded(char('.'), parse_name))(input)?;
    let mut segments = vec![first.to_string()];
    segments.extend(rest.into_iter().map(str::to_string));
    Ok((input, Expr::Path(segments)))
}
