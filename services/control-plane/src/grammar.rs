//! Firewall rule grammar.
//!
//! The control plane treats rule text as opaque once it has been validated by
//! a [`RuleGrammar`]. The only structure it needs back is the set of machines
//! a rule refers to, for the rule/machine listings.
//!
//! [`BasicRuleGrammar`] accepts rules of the form
//!
//! ```text
//! FROM <targets> TO <targets> (ALLOW|BLOCK) <protocol> <ports>
//! ```
//!
//! where targets are `any`, `all vms`, `vm <id>`, `ip <addr>`,
//! `subnet <cidr>` or `tag <name>`, optionally grouped with parentheses and
//! joined with `OR`, and ports are `port <n>` / `port all` joined with `AND`
//! (`type <n> [code <n>]` for ICMP). Keywords are case-insensitive.

use std::net::IpAddr;

use jobplane_id::MachineId;
use thiserror::Error;

/// Rule grammar errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GrammarError {
    #[error("rule text is empty")]
    Empty,

    #[error("expected {expected} but found '{found}'")]
    Unexpected {
        expected: &'static str,
        found: String,
    },

    #[error("rule ended early: expected {0}")]
    UnexpectedEnd(&'static str),

    #[error("invalid {what} '{value}'")]
    InvalidValue { what: &'static str, value: String },

    #[error("unbalanced parentheses")]
    UnbalancedParens,
}

/// What the control plane needs to know about a valid rule.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedRule {
    /// Machines named explicitly with `vm <id>`.
    pub machines: Vec<MachineId>,
    /// Whether the rule names `all vms`.
    pub all_vms: bool,
}

impl ParsedRule {
    /// Whether the rule applies to the given machine.
    pub fn affects(&self, machine_id: &MachineId) -> bool {
        self.all_vms || self.machines.contains(machine_id)
    }
}

/// Validates rule text.
pub trait RuleGrammar: Send + Sync {
    fn parse(&self, text: &str) -> Result<ParsedRule, GrammarError>;
}

/// Default rule grammar.
#[derive(Debug, Clone, Copy, Default)]
pub struct BasicRuleGrammar;

impl RuleGrammar for BasicRuleGrammar {
    fn parse(&self, text: &str) -> Result<ParsedRule, GrammarError> {
        let tokens = tokenize(text)?;
        if tokens.is_empty() {
            return Err(GrammarError::Empty);
        }

        let mut parser = Parser {
            tokens,
            pos: 0,
            parsed: ParsedRule::default(),
        };
        parser.rule()?;
        Ok(parser.parsed)
    }
}

/// Split on whitespace, drop parentheses after checking they balance.
fn tokenize(text: &str) -> Result<Vec<String>, GrammarError> {
    let mut depth = 0i32;
    for c in text.chars() {
        match c {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth < 0 {
                    return Err(GrammarError::UnbalancedParens);
                }
            }
            _ => {}
        }
    }
    if depth != 0 {
        return Err(GrammarError::UnbalancedParens);
    }

    Ok(text
        .replace(['(', ')'], " ")
        .split_whitespace()
        .map(str::to_string)
        .collect())
}

struct Parser {
    tokens: Vec<String>,
    pos: usize,
    parsed: ParsedRule,
}

impl Parser {
    fn peek(&self) -> Option<&str> {
        self.tokens.get(self.pos).map(String::as_str)
    }

    fn peek_keyword(&self, keyword: &str) -> bool {
        self.peek().is_some_and(|t| t.eq_ignore_ascii_case(keyword))
    }

    fn next(&mut self, expected: &'static str) -> Result<String, GrammarError> {
        let token = self
            .tokens
            .get(self.pos)
            .cloned()
            .ok_or(GrammarError::UnexpectedEnd(expected))?;
        self.pos += 1;
        Ok(token)
    }

    fn keyword(&mut self, keyword: &'static str) -> Result<(), GrammarError> {
        let token = self.next(keyword)?;
        if token.eq_ignore_ascii_case(keyword) {
            Ok(())
        } else {
            Err(GrammarError::Unexpected {
                expected: keyword,
                found: token,
            })
        }
    }

    fn rule(&mut self) -> Result<(), GrammarError> {
        self.keyword("FROM")?;
        self.targets()?;
        self.keyword("TO")?;
        self.targets()?;

        let action = self.next("ALLOW or BLOCK")?;
        if !(action.eq_ignore_ascii_case("allow") || action.eq_ignore_ascii_case("block")) {
            return Err(GrammarError::Unexpected {
                expected: "ALLOW or BLOCK",
                found: action,
            });
        }

        let protocol = self.next("protocol")?.to_ascii_lowercase();
        match protocol.as_str() {
            "tcp" | "udp" => self.ports()?,
            "icmp" | "icmp6" => self.icmp_types()?,
            _ => {
                return Err(GrammarError::InvalidValue {
                    what: "protocol",
                    value: protocol,
                })
            }
        }

        match self.peek() {
            None => Ok(()),
            Some(extra) => Err(GrammarError::Unexpected {
                expected: "end of rule",
                found: extra.to_string(),
            }),
        }
    }

    fn targets(&mut self) -> Result<(), GrammarError> {
        self.target()?;
        while self.peek_keyword("OR") {
            self.pos += 1;
            self.target()?;
        }
        Ok(())
    }

    fn target(&mut self) -> Result<(), GrammarError> {
        let kind = self.next("target")?.to_ascii_lowercase();
        match kind.as_str() {
            "any" => Ok(()),
            "all" => {
                self.keyword("VMS")?;
                self.parsed.all_vms = true;
                Ok(())
            }
            "vm" => {
                let value = self.next("machine id")?;
                let id = MachineId::parse(&value).map_err(|_| GrammarError::InvalidValue {
                    what: "machine id",
                    value,
                })?;
                if !self.parsed.machines.contains(&id) {
                    self.parsed.machines.push(id);
                }
                Ok(())
            }
            "ip" => {
                let value = self.next("ip address")?;
                value
                    .parse::<IpAddr>()
                    .map(|_| ())
                    .map_err(|_| GrammarError::InvalidValue {
                        what: "ip address",
                        value,
                    })
            }
            "subnet" => {
                let value = self.next("subnet")?;
                if valid_cidr(&value) {
                    Ok(())
                } else {
                    Err(GrammarError::InvalidValue {
                        what: "subnet",
                        value,
                    })
                }
            }
            "tag" => {
                self.next("tag name")?;
                Ok(())
            }
            _ => Err(GrammarError::Unexpected {
                expected: "target",
                found: kind,
            }),
        }
    }

    fn ports(&mut self) -> Result<(), GrammarError> {
        loop {
            self.keyword("PORT")?;
            let value = self.next("port")?;
            if !value.eq_ignore_ascii_case("all") && !matches!(value.parse::<u16>(), Ok(p) if p > 0) {
                return Err(GrammarError::InvalidValue { what: "port", value });
            }
            if !self.peek_keyword("AND") {
                return Ok(());
            }
            self.pos += 1;
        }
    }

    fn icmp_types(&mut self) -> Result<(), GrammarError> {
        loop {
            self.keyword("TYPE")?;
            self.number("icmp type")?;
            if self.peek_keyword("CODE") {
                self.pos += 1;
                self.number("icmp code")?;
            }
            if !self.peek_keyword("AND") {
                return Ok(());
            }
            self.pos += 1;
        }
    }

    fn number(&mut self, what: &'static str) -> Result<(), GrammarError> {
        let value = self.next(what)?;
        value
            .parse::<u8>()
            .map(|_| ())
            .map_err(|_| GrammarError::InvalidValue { what, value })
    }
}

fn valid_cidr(value: &str) -> bool {
    let Some((addr, prefix)) = value.split_once('/') else {
        return false;
    };
    let Ok(addr) = addr.parse::<IpAddr>() else {
        return false;
    };
    let max = if addr.is_ipv4() { 32 } else { 128 };
    matches!(prefix.parse::<u8>(), Ok(p) if p <= max)
}
