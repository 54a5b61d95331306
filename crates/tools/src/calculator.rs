//! Calculator capability: evaluates arithmetic found in natural language.
//!
//! Supports `+`, `-`, `*`, `/`, `%`, `^`, square roots, parentheses and
//! unary negation through a recursive-descent parser. The expression can be
//! given directly (`expression`) or pulled out of the query text, where
//! operator words ("times", "divided by", "multiply 3 by 4") are rewritten
//! and references such as "that" resolve to the previous answer found in
//! the supplied conversation context.

use async_trait::async_trait;
use regex_lite::Regex;
use routewise_core::capability::{Capability, CapabilityOutput};

pub struct CalculatorTool;

#[async_trait]
impl Capability for CalculatorTool {
    fn name(&self) -> &str {
        "calculator"
    }

    fn description(&self) -> &str {
        "Perform mathematical calculations and evaluate arithmetic expressions. Use this for math problems, numerical computations, or any question that involves calculating a number."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "expression": {
                    "type": "string",
                    "description": "The expression to evaluate, e.g. '(2 + 3) * 4'"
                },
                "query": {
                    "type": "string",
                    "description": "Natural-language request containing the calculation"
                },
                "context": {
                    "type": "string",
                    "description": "Recent conversation, used to resolve 'that' or 'the result'"
                }
            }
        })
    }

    async fn execute(&self, parameters: serde_json::Value) -> CapabilityOutput {
        let expression = match parameters["expression"].as_str() {
            Some(expr) if !expr.trim().is_empty() => expr.trim().to_string(),
            _ => {
                let Some(query) = parameters["query"].as_str() else {
                    return CapabilityOutput::failure("Missing 'expression' or 'query' argument");
                };
                let previous = parameters["context"].as_str().and_then(previous_result);
                match extract_expression(query, previous) {
                    Ok(expr) => expr,
                    Err(e) => return CapabilityOutput::failure(e),
                }
            }
        };

        match evaluate(&expression) {
            Ok(value) => {
                let formatted = format_number(value);
                CapabilityOutput::ok(format!("{expression} = {formatted}"))
                    .with_data(serde_json::json!({"expression": expression, "result": value}))
            }
            Err(e) => CapabilityOutput::failure(format!("Invalid expression '{expression}': {e}")),
        }
    }
}

/// Remove trailing `.0` for integers.
pub fn format_number(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{}", value)
    }
}

const NUM: &str = r"(-?\d+(?:\.\d+)?)";

fn regex(pattern: &str) -> Result<Regex, String> {
    Regex::new(pattern).map_err(|e| format!("internal pattern error: {e}"))
}

/// The number the last assistant line of `context` ended on (after its last
/// `=`, when there is one).
pub fn previous_result(context: &str) -> Option<f64> {
    let line = context
        .lines()
        .rev()
        .find_map(|l| l.trim().strip_prefix("Assistant:"))?;
    let tail = line.rsplit('=').next().unwrap_or(line);
    let numbers = regex(NUM).ok()?;
    numbers
        .find_iter(tail)
        .last()
        .and_then(|m| m.as_str().parse().ok())
}

/// Pull an arithmetic expression out of a natural-language query.
pub fn extract_expression(query: &str, previous: Option<f64>) -> Result<String, String> {
    let mut text = format!(" {} ", query.to_lowercase());

    if let Some(prev) = previous {
        let references = regex(r"\b(?:the previous result|the result|the answer|that|it|this)\b")?;
        text = references
            .replace_all(&text, format_number(prev).as_str())
            .into_owned();
    }

    let verbs: [(String, &str); 6] = [
        (format!(r"\bmultiply\s+{NUM}\s+(?:by|and|with)\s+{NUM}"), "${1} * ${2}"),
        (format!(r"\bdivide\s+{NUM}\s+by\s+{NUM}"), "${1} / ${2}"),
        (format!(r"\badd\s+{NUM}\s+(?:to|and)\s+{NUM}"), "${1} + ${2}"),
        (format!(r"\bsubtract\s+{NUM}\s+from\s+{NUM}"), "${2} - ${1}"),
        (format!(r"\bsum\s+of\s+{NUM}\s+and\s+{NUM}"), "${1} + ${2}"),
        (format!(r"\bproduct\s+of\s+{NUM}\s+and\s+{NUM}"), "${1} * ${2}"),
    ];
    for (pattern, replacement) in &verbs {
        text = regex(pattern)?.replace_all(&text, *replacement).into_owned();
    }

    let words: [(&str, &str); 9] = [
        (r"(\d)\s*x\s*(\d)", "${1} * ${2}"),
        (r"\b(?:multiplied by|times)\b", " * "),
        (r"\b(?:divided by|over)\b", " / "),
        (r"\bplus\b", " + "),
        (r"\bminus\b", " - "),
        (r"\bmod(?:ulo)?\b", " % "),
        (r"\bto the power of\b", " ^ "),
        (r"\bsquared\b", " ^ 2 "),
        (r"\b(?:square root of|sqrt)\b", " √ "),
    ];
    for (pattern, replacement) in words {
        text = regex(pattern)?.replace_all(&text, replacement).into_owned();
    }

    let runs = regex(r"[\d.+\-*/^%()√\s]*\d[\d.+\-*/^%()√\s]*")?;
    runs.find_iter(&text)
        .map(|m| m.as_str().trim().trim_end_matches(['.', ' ']).to_string())
        .filter(|s| !s.is_empty())
        .max_by_key(|s| s.len())
        .ok_or_else(|| "No arithmetic expression found in the query".to_string())
}

// ── Recursive-descent expression evaluator ────────────────────────────────

/// Evaluate a mathematical expression string.
pub fn evaluate(expr: &str) -> Result<f64, String> {
    let tokens = tokenize(expr)?;
    let mut parser = Parser::new(&tokens);
    let result = parser.parse_expr()?;
    if parser.pos < parser.tokens.len() {
        return Err(format!(
            "Unexpected token at position {}: {:?}",
            parser.pos, parser.tokens[parser.pos]
        ));
    }
    if !result.is_finite() {
        return Err("Result is not a finite number".into());
    }
    Ok(result)
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Caret,
    Sqrt,
    LParen,
    RParen,
}

fn tokenize(input: &str) -> Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = input.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        match chars[i] {
            c if c.is_whitespace() => i += 1,
            '+' => { tokens.push(Token::Plus); i += 1; }
            '-' => { tokens.push(Token::Minus); i += 1; }
            '*' | '×' => { tokens.push(Token::Star); i += 1; }
            '/' | '÷' => { tokens.push(Token::Slash); i += 1; }
            '%' => { tokens.push(Token::Percent); i += 1; }
            '^' => { tokens.push(Token::Caret); i += 1; }
            '√' => { tokens.push(Token::Sqrt); i += 1; }
            '(' => { tokens.push(Token::LParen); i += 1; }
            ')' => { tokens.push(Token::RParen); i += 1; }
            c if c.is_ascii_digit() || c == '.' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let num_str: String = chars[start..i].iter().collect();
                let num: f64 = num_str
                    .parse()
                    .map_err(|_| format!("Invalid number: {}", num_str))?;
                tokens.push(Token::Number(num));
            }
            c => return Err(format!("Unexpected character: '{}'", c)),
        }
    }

    Ok(tokens)
}

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(tokens: &'a [Token]) -> Self {
        Self { tokens, pos: 0 }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn consume(&mut self) -> Option<&Token> {
        let tok = self.tokens.get(self.pos);
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    // expr = term (('+' | '-') term)*
    fn parse_expr(&mut self) -> Result<f64, String> {
        let mut left = self.parse_term()?;
        while let Some(op) = self.peek() {
            match op {
                Token::Plus => {
                    self.consume();
                    left += self.parse_term()?;
                }
                Token::Minus => {
                    self.consume();
                    left -= self.parse_term()?;
                }
                _ => break,
            }
        }
        Ok(left)
    }

    // term = unary (('*' | '/' | '%') unary)*
    fn parse_term(&mut self) -> Result<f64, String> {
        let mut left = self.parse_unary()?;
        while let Some(op) = self.peek() {
            match op {
                Token::Star => {
                    self.consume();
                    left *= self.parse_unary()?;
                }
                Token::Slash | Token::Percent => {
                    let modulo = *op == Token::Percent;
                    self.consume();
                    let right = self.parse_unary()?;
                    if right == 0.0 {
                        return Err("Division by zero".into());
                    }
                    if modulo {
                        left %= right;
                    } else {
                        left /= right;
                    }
                }
                _ => break,
            }
        }
        Ok(left)
    }

    // unary = '-' unary | '√' unary | power
    fn parse_unary(&mut self) -> Result<f64, String> {
        match self.peek() {
            Some(Token::Minus) => {
                self.consume();
                Ok(-self.parse_unary()?)
            }
            Some(Token::Sqrt) => {
                self.consume();
                let val = self.parse_unary()?;
                if val < 0.0 {
                    return Err("Square root of a negative number".into());
                }
                Ok(val.sqrt())
            }
            _ => self.parse_power(),
        }
    }

    // power = primary ('^' unary)?
    fn parse_power(&mut self) -> Result<f64, String> {
        let base = self.parse_primary()?;
        if let Some(Token::Caret) = self.peek() {
            self.consume();
            let exponent = self.parse_unary()?;
            return Ok(base.powf(exponent));
        }
        Ok(base)
    }

    // primary = NUMBER | '(' expr ')'
    fn parse_primary(&mut self) -> Result<f64, String> {
        match self.consume() {
            Some(Token::Number(n)) => Ok(*n),
            Some(Token::LParen) => {
                let val = self.parse_expr()?;
                match self.consume() {
                    Some(Token::RParen) => Ok(val),
                    _ => Err("Expected closing parenthesis".into()),
                }
            }
            Some(tok) => Err(format!("Unexpected token: {:?}", tok)),
            None => Err("Unexpected end of expression".into()),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operator_precedence() {
        assert_eq!(evaluate("2 + 3 * 4").unwrap(), 14.0);
        assert_eq!(evaluate("(2 + 3) * 4").unwrap(), 20.0);
        assert_eq!(evaluate("((1 + 2) * (3 + 4))").unwrap(), 21.0);
    }

    #[test]
    fn powers_roots_and_modulo() {
        assert_eq!(evaluate("2 ^ 3 ^ 2").unwrap(), 512.0);
        assert_eq!(evaluate("-2 ^ 2").unwrap(), -4.0);
        assert_eq!(evaluate("√16 + 1").unwrap(), 5.0);
        assert_eq!(evaluate("10 % 4").unwrap(), 2.0);
        assert!(evaluate("√-4").is_err());
    }

    #[test]
    fn division_by_zero() {
        assert!(evaluate("1 / 0").is_err());
        assert!(evaluate("1 % 0").is_err());
    }

    #[test]
    fn decimals() {
        assert_eq!(evaluate("3.14 * 2").unwrap(), 6.28);
    }

    #[test]
    fn invalid_expression() {
        assert!(evaluate("2 +").is_err());
        assert!(evaluate("").is_err());
    }

    #[test]
    fn extracts_from_natural_language() {
        assert_eq!(extract_expression("Calculate 12*7", None).unwrap(), "12*7");
        assert_eq!(extract_expression("What is 3 + 4?", None).unwrap(), "3 + 4");
        assert_eq!(extract_expression("Compute 10+5.", None).unwrap(), "10+5");
        let expr = extract_expression("what is 6 times 7", None).unwrap();
        assert_eq!(evaluate(&expr).unwrap(), 42.0);
        let expr = extract_expression("subtract 4 from 10", None).unwrap();
        assert_eq!(evaluate(&expr).unwrap(), 6.0);
        let expr = extract_expression("square root of 81", None).unwrap();
        assert_eq!(evaluate(&expr).unwrap(), 9.0);
        assert!(extract_expression("tell me a story", None).is_err());
    }

    #[test]
    fn resolves_previous_result() {
        let context = "[Recent conversation]\nUser: Compute 10+5\nAssistant: 10+5 = 15";
        assert_eq!(previous_result(context), Some(15.0));
        let expr = extract_expression("multiply that by 3", previous_result(context)).unwrap();
        assert_eq!(evaluate(&expr).unwrap(), 45.0);
        assert_eq!(previous_result("User: hello"), None);
    }

    #[tokio::test]
    async fn execute_with_expression() {
        let out = CalculatorTool
            .execute(serde_json::json!({"expression": "10 / 2"}))
            .await;
        assert!(out.success);
        assert_eq!(out.output, "10 / 2 = 5");
        assert_eq!(out.data.unwrap()["result"], 5.0);
    }

    #[tokio::test]
    async fn execute_with_query_and_context() {
        let out = CalculatorTool
            .execute(serde_json::json!({
                "query": "multiply that by 3",
                "context": "User: Compute 10+5\nAssistant: 10+5 = 15"
            }))
            .await;
        assert!(out.success);
        assert!(out.output.ends_with("= 45"));
    }

    #[tokio::test]
    async fn execute_reports_failures() {
        let out = CalculatorTool.execute(serde_json::json!({})).await;
        assert!(!out.success);
        assert!(out.error.unwrap().contains("Missing"));

        let out = CalculatorTool
            .execute(serde_json::json!({"expression": "1 / 0"}))
            .await;
        assert!(!out.success);
        assert!(out.error.unwrap().contains("Invalid expression"));
    }

    #[test]
    fn descriptor() {
        let d = CalculatorTool.descriptor();
        assert_eq!(d.name, "calculator");
        assert!(d.description.contains("calculat"));
    }
}
