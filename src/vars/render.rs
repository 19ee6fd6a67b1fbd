// String interpolation over the scope stack
//
// Supported references: {{name}}, {{var "n"}}, {{default v d}}, {{env "n"}},
// {{hostvars host key}}, {{groupvars group key}}.

use std::collections::HashMap;
use std::sync::Arc;

use serde_yaml::Value;

use super::{value_to_string, ScopeKind, VarManager};
use crate::output::{ArmadaError, TemplateErrorKind};

/// Interpolates `{{...}}` references in strings, maps and lists.
///
/// Variables come from the manager's merged view, overlaid by per-call
/// extras. Malformed templates surface parse errors; unresolvable
/// references surface render errors. Both are fatal for the task.
pub struct Renderer {
    manager: Arc<VarManager>,
}

#[derive(Debug)]
struct Token {
    text: String,
    quoted: bool,
}

impl Renderer {
    pub fn new(manager: Arc<VarManager>) -> Self {
        Renderer { manager }
    }

    pub fn manager(&self) -> &Arc<VarManager> {
        &self.manager
    }

    /// Render every `{{...}}` reference in `text`
    pub fn render_string(
        &self,
        text: &str,
        extra: Option<&HashMap<String, Value>>,
    ) -> Result<String, ArmadaError> {
        if !text.contains("{{") {
            return Ok(text.to_string());
        }

        let mut vars = self.manager.get_all_vars();
        if let Some(extra) = extra {
            vars.extend(extra.iter().map(|(k, v)| (k.clone(), v.clone())));
        }

        let mut out = String::with_capacity(text.len());
        let mut rest = text;

        while let Some(start) = rest.find("{{") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];

            let end = after.find("}}").ok_or_else(|| ArmadaError::Template {
                kind: TemplateErrorKind::Parse,
                detail: format!("unclosed '{{{{' in \"{}\"", text),
            })?;

            let expr = after[..end].trim();
            if expr.is_empty() {
                return Err(ArmadaError::Template {
                    kind: TemplateErrorKind::Parse,
                    detail: format!("empty reference in \"{}\"", text),
                });
            }

            let value = self.eval(expr, &vars)?;
            out.push_str(&value_to_string(&value));
            rest = &after[end + 2..];
        }

        out.push_str(rest);
        Ok(out)
    }

    /// Recursively render strings inside maps and lists; other values pass
    /// through unchanged.
    pub fn render_value(
        &self,
        value: &Value,
        extra: Option<&HashMap<String, Value>>,
    ) -> Result<Value, ArmadaError> {
        match value {
            Value::String(s) => Ok(Value::String(self.render_string(s, extra)?)),
            Value::Sequence(items) => {
                let mut rendered = Vec::with_capacity(items.len());
                for item in items {
                    rendered.push(self.render_value(item, extra)?);
                }
                Ok(Value::Sequence(rendered))
            }
            Value::Mapping(map) => {
                let mut rendered = serde_yaml::Mapping::with_capacity(map.len());
                for (k, v) in map {
                    rendered.insert(k.clone(), self.render_value(v, extra)?);
                }
                Ok(Value::Mapping(rendered))
            }
            other => Ok(other.clone()),
        }
    }

    fn eval(&self, expr: &str, vars: &HashMap<String, Value>) -> Result<Value, ArmadaError> {
        let tokens = tokenize(expr)?;

        if tokens.len() == 1 {
            let tok = &tokens[0];
            if tok.quoted {
                return Ok(Value::String(tok.text.clone()));
            }
            return self.lookup(&tok.text, vars);
        }

        let helper = &tokens[0];
        if helper.quoted {
            return Err(ArmadaError::Template {
                kind: TemplateErrorKind::Parse,
                detail: format!("helper name must not be quoted in '{}'", expr),
            });
        }

        let args = &tokens[1..];
        match helper.text.as_str() {
            "var" => {
                let name = expect_args(expr, args, 1)?[0];
                self.lookup(&name.text, vars)
            }
            "env" => {
                let name = expect_args(expr, args, 1)?[0];
                std::env::var(&name.text).map(Value::String).map_err(|_| {
                    ArmadaError::Template {
                        kind: TemplateErrorKind::Render,
                        detail: format!("environment variable '{}' is not set", name.text),
                    }
                })
            }
            "default" => {
                let args = expect_args(expr, args, 2)?;
                let primary = if args[0].quoted {
                    Some(Value::String(args[0].text.clone()))
                } else {
                    vars.get(&args[0].text).cloned()
                };
                match primary {
                    Some(val) if val != Value::Null => Ok(val),
                    _ => Ok(self.arg_value(args[1], vars)),
                }
            }
            "hostvars" => {
                let args = expect_args(expr, args, 2)?;
                let host = value_to_string(&self.arg_value(args[0], vars));
                let key = value_to_string(&self.arg_value(args[1], vars));
                self.scoped_lookup(ScopeKind::Host, &host, &key)
            }
            "groupvars" => {
                let args = expect_args(expr, args, 2)?;
                let group = value_to_string(&self.arg_value(args[0], vars));
                let key = value_to_string(&self.arg_value(args[1], vars));
                self.scoped_lookup(ScopeKind::Group, &group, &key)
            }
            other => Err(ArmadaError::Template {
                kind: TemplateErrorKind::Parse,
                detail: format!("unknown helper '{}' in '{}'", other, expr),
            }),
        }
    }

    fn lookup(&self, name: &str, vars: &HashMap<String, Value>) -> Result<Value, ArmadaError> {
        vars.get(name).cloned().ok_or_else(|| ArmadaError::Template {
            kind: TemplateErrorKind::Render,
            detail: format!("undefined variable '{}'", name),
        })
    }

    /// Quoted tokens are literals; bare tokens resolve as variables and fall
    /// back to their own text (so numeric literals work unquoted).
    fn arg_value(&self, token: &Token, vars: &HashMap<String, Value>) -> Value {
        if token.quoted {
            return Value::String(token.text.clone());
        }
        vars.get(&token.text)
            .cloned()
            .unwrap_or_else(|| Value::String(token.text.clone()))
    }

    fn scoped_lookup(
        &self,
        kind: ScopeKind,
        name: &str,
        key: &str,
    ) -> Result<Value, ArmadaError> {
        self.manager
            .scope(kind, name)
            .and_then(|s| s.get(key))
            .ok_or_else(|| ArmadaError::Template {
                kind: TemplateErrorKind::Render,
                detail: format!("no {} variable '{}' for '{}'", kind.as_str(), key, name),
            })
    }
}

fn expect_args<'t>(
    expr: &str,
    args: &'t [Token],
    count: usize,
) -> Result<Vec<&'t Token>, ArmadaError> {
    if args.len() != count {
        return Err(ArmadaError::Template {
            kind: TemplateErrorKind::Parse,
            detail: format!(
                "'{}' takes {} argument(s), got {}",
                expr,
                count,
                args.len()
            ),
        });
    }
    Ok(args.iter().collect())
}

fn tokenize(expr: &str) -> Result<Vec<Token>, ArmadaError> {
    let mut tokens = Vec::new();
    let mut chars = expr.chars().peekable();

    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            continue;
        }

        if c == '"' {
            chars.next();
            let mut text = String::new();
            loop {
                match chars.next() {
                    Some('"') => break,
                    Some(ch) => text.push(ch),
                    None => {
                        return Err(ArmadaError::Template {
                            kind: TemplateErrorKind::Parse,
                            detail: format!("unterminated string in '{}'", expr),
                        })
                    }
                }
            }
            tokens.push(Token { text, quoted: true });
        } else {
            let mut text = String::new();
            while let Some(&ch) = chars.peek() {
                if ch.is_whitespace() {
                    break;
                }
                text.push(ch);
                chars.next();
            }
            tokens.push(Token {
                text,
                quoted: false,
            });
        }
    }

    Ok(tokens)
}
