//! Command-line tokenizer.
//!
//! Splits on whitespace, honoring quoted strings (with backslash escapes).
//! Brackets open a nested command evaluated before the outer one. With
//! pipe syntax on, `a b | c d` becomes `c d [a b]`: the left side's reply
//! is the final argument of the right side.

use super::CommandError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    Word(String),
    Nested(Vec<Token>),
}

impl Token {
    pub fn word(s: &str) -> Self {
        Token::Word(s.to_string())
    }

    pub fn as_word(&self) -> Option<&str> {
        match self {
            Token::Word(w) => Some(w),
            Token::Nested(_) => None,
        }
    }

    /// Deepest bracket nesting inside this token (0 for a word).
    pub fn depth(&self) -> usize {
        match self {
            Token::Word(_) => 0,
            Token::Nested(inner) => 1 + inner.iter().map(Token::depth).max().unwrap_or(0),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Syntax {
    pub quotes: String,
    /// Open and close characters for nesting; `None` disables nesting.
    pub brackets: Option<(char, char)>,
    pub pipe: bool,
}

impl Default for Syntax {
    fn default() -> Self {
        Self {
            quotes: "\"".into(),
            brackets: Some(('[', ']')),
            pipe: false,
        }
    }
}

impl Syntax {
    /// Build from the `commands.nested.brackets` value: two characters or
    /// empty to disable.
    pub fn with_brackets(mut self, spec: &str) -> Self {
        let mut chars = spec.chars();
        self.brackets = match (chars.next(), chars.next()) {
            (Some(open), Some(close)) if open != close => Some((open, close)),
            _ => None,
        };
        self
    }
}

pub fn tokenize(text: &str, syntax: &Syntax) -> Result<Vec<Token>, CommandError> {
    parse_seq(&mut text.chars(), syntax, None)
}

type Chars<'a> = std::str::Chars<'a>;

fn parse_seq(chars: &mut Chars<'_>, syntax: &Syntax, close: Option<char>) -> Result<Vec<Token>, CommandError> {
    let (open, closer) = syntax.brackets.unzip();
    let mut tokens = Vec::new();
    let mut word = String::new();
    let flush = |word: &mut String, tokens: &mut Vec<Token>| {
        if !word.is_empty() {
            tokens.push(Token::Word(std::mem::take(word)));
        }
    };
    loop {
        let Some(c) = chars.next() else {
            if let Some(close) = close {
                return Err(CommandError::Syntax(format!("Missing \"{close}\".")));
            }
            flush(&mut word, &mut tokens);
            return Ok(tokens);
        };
        if Some(c) == close {
            flush(&mut word, &mut tokens);
            return Ok(tokens);
        }
        match c {
            c if c.is_whitespace() => flush(&mut word, &mut tokens),
            c if syntax.quotes.contains(c) => {
                word.push_str(&parse_quoted(chars, c)?);
                // An empty quoted string is still an argument.
                if word.is_empty() {
                    tokens.push(Token::Word(String::new()));
                }
            }
            c if Some(c) == open => {
                flush(&mut word, &mut tokens);
                let inner = parse_seq(chars, syntax, closer)?;
                if inner.is_empty() {
                    return Err(CommandError::Syntax("Empty nested command.".into()));
                }
                tokens.push(Token::Nested(inner));
            }
            c if Some(c) == closer => {
                return Err(CommandError::Syntax(format!("Spurious \"{c}\".")));
            }
            '|' if syntax.pipe && word.is_empty() => {
                let left = std::mem::take(&mut tokens);
                if left.is_empty() {
                    return Err(CommandError::Syntax("\"|\" with nothing preceding.".into()));
                }
                let mut right = parse_seq(chars, syntax, close)?;
                if right.is_empty() {
                    return Err(CommandError::Syntax("\"|\" with nothing following.".into()));
                }
                right.push(Token::Nested(left));
                return Ok(right);
            }
            c => word.push(c),
        }
    }
}

fn parse_quoted(chars: &mut Chars<'_>, quote: char) -> Result<String, CommandError> {
    let mut out = String::new();
    while let Some(c) = chars.next() {
        match c {
            '\\' => match chars.next() {
                Some('n') => out.push('\n'),
                Some('t') => out.push('\t'),
                Some(other) => out.push(other),
                None => break,
            },
            c if c == quote => return Ok(out),
            c => out.push(c),
        }
    }
    Err(CommandError::Syntax(format!("Missing \"{quote}\".")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn w(s: &str) -> Token {
        Token::word(s)
    }

    #[test]
    fn words_and_quotes() {
        let t = tokenize(r#"echo "hello  world" a\b "x\"y" """#, &Syntax::default()).unwrap();
        assert_eq!(t, vec![w("echo"), w("hello  world"), w("a\\b"), w("x\"y"), w("")]);
    }

    #[test]
    fn nested_brackets() {
        let t = tokenize("echo [echo nested] tail", &Syntax::default()).unwrap();
        assert_eq!(t, vec![w("echo"), Token::Nested(vec![w("echo"), w("nested")]), w("tail")]);
        let deep = tokenize("a [b [c [d]]]", &Syntax::default()).unwrap();
        assert_eq!(deep[1].depth(), 3);
    }

    #[test]
    fn quoted_brackets_do_not_nest() {
        let t = tokenize(r#"echo "[not nested]""#, &Syntax::default()).unwrap();
        assert_eq!(t, vec![w("echo"), w("[not nested]")]);
    }

    #[test]
    fn unbalanced_input_is_a_syntax_error() {
        assert!(matches!(tokenize("echo [a", &Syntax::default()), Err(CommandError::Syntax(_))));
        assert!(matches!(tokenize("echo a]", &Syntax::default()), Err(CommandError::Syntax(_))));
        assert!(matches!(tokenize("echo \"a", &Syntax::default()), Err(CommandError::Syntax(_))));
        assert!(matches!(tokenize("echo []", &Syntax::default()), Err(CommandError::Syntax(_))));
    }

    #[test]
    fn pipes_feed_the_last_argument() {
        let syntax = Syntax { pipe: true, ..Syntax::default() };
        let t = tokenize("echo hi | rot13 | upper x", &syntax).unwrap();
        assert_eq!(
            t,
            vec![
                w("upper"),
                w("x"),
                Token::Nested(vec![w("rot13"), Token::Nested(vec![w("echo"), w("hi")])]),
            ]
        );
        let off = tokenize("echo a | b", &Syntax::default()).unwrap();
        assert_eq!(off, vec![w("echo"), w("a"), w("|"), w("b")]);
    }

    #[test]
    fn custom_or_disabled_brackets() {
        let braces = Syntax::default().with_brackets("{}");
        let t = tokenize("echo {echo x} [y]", &braces).unwrap();
        assert_eq!(t[1], Token::Nested(vec![w("echo"), w("x")]));
        assert_eq!(t[2], w("[y]"));
        let none = Syntax::default().with_brackets("");
        assert_eq!(tokenize("echo [x]", &none).unwrap()[1], w("[x]"));
    }
}
