//! Command templates with `{placeholder}` substitution.

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TemplateError {
    #[error("command template is empty")]
    Empty,

    #[error("invalid command template {template:?}: {message}")]
    Parse { template: String, message: String },
}

/// A command line split with shell rules once, rendered many times.
///
/// Placeholders are substituted per argument after splitting, so a value
/// containing spaces or quotes stays a single argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTemplate {
    source: String,
    argv: Vec<String>,
}

impl CommandTemplate {
    pub fn parse(source: &str) -> Result<Self, TemplateError> {
        let argv = shell_words::split(source).map_err(|e| TemplateError::Parse {
            template: source.to_string(),
            message: e.to_string(),
        })?;
        if argv.is_empty() {
            return Err(TemplateError::Empty);
        }
        Ok(Self {
            source: source.to_string(),
            argv,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn render(&self, vars: &[(&str, &str)]) -> Vec<String> {
        self.argv.iter().map(|arg| substitute(arg, vars)).collect()
    }
}

/// Replace each `{key}` whose key is in `vars`; anything else, including
/// unknown placeholders such as `{pgurl:1-3}`, is kept verbatim. Single pass:
/// substituted values are never rescanned.
pub fn substitute(text: &str, vars: &[(&str, &str)]) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let Some(close) = after.find('}') else {
            out.push_str(&rest[open..]);
            return out;
        };
        let key = &after[..close];
        match vars.iter().find(|(k, _)| *k == key) {
            Some((_, value)) => out.push_str(value),
            None => {
                out.push('{');
                out.push_str(key);
                out.push('}');
            }
        }
        rest = &after[close + 1..];
    }

    out.push_str(rest);
    out
}
