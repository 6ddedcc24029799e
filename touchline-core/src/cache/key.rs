use itertools::Itertools;
use std::collections::BTreeMap;
use std::fmt::Display;

/// Cache key built from a call site and its arguments.
///
/// Without a template the key renders as
/// `[{module}]:[{func}]:[{args}]:[{sorted kwargs}]`, so two call sites
/// never collide even with identical arguments. With a template, every
/// `{name}` placeholder is replaced by the kwarg of the same name; this is
/// used where the key layout is shared with another process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheKey {
    module: &'static str,
    func: &'static str,
    template: Option<&'static str>,
    args: Vec<String>,
    kwargs: BTreeMap<&'static str, String>,
}

impl CacheKey {
    pub fn new(module: &'static str, func: &'static str) -> Self {
        Self {
            module,
            func,
            template: None,
            args: Vec::new(),
            kwargs: BTreeMap::new(),
        }
    }

    pub fn template(template: &'static str) -> Self {
        Self {
            module: "",
            func: "",
            template: Some(template),
            args: Vec::new(),
            kwargs: BTreeMap::new(),
        }
    }

    pub fn arg(mut self, value: impl Display) -> Self {
        self.args.push(value.to_string());
        self
    }

    pub fn kwarg(mut self, name: &'static str, value: impl Display) -> Self {
        self.kwargs.insert(name, value.to_string());
        self
    }

    pub fn render(&self) -> String {
        match self.template {
            Some(template) => self.kwargs.iter().fold(template.to_string(), |acc, (k, v)| {
                acc.replace(&format!("{{{k}}}"), v)
            }),
            None => format!(
                "[{}]:[{}]:[{}]:[{}]",
                self.module,
                self.func,
                self.args.iter().join(","),
                self.kwargs.iter().map(|(k, v)| format!("{k}={v}")).join(",")
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_layout_sorts_kwargs() {
        let key = CacheKey::new("matches", "get_match")
            .arg(10)
            .kwarg("user_id", 3)
            .kwarg("chat_id", 7);
        assert_eq!(key.render(), "[matches]:[get_match]:[10]:[chat_id=7,user_id=3]");
    }

    #[test]
    fn test_distinct_call_sites_do_not_collide() {
        let a = CacheKey::new("chats", "get").arg(1);
        let b = CacheKey::new("tickets", "get").arg(1);
        assert_ne!(a.render(), b.render());
    }

    #[test]
    fn test_template_substitution() {
        let key = CacheKey::template("unread:[by_chat]:{user_id}:{chat_id}")
            .kwarg("chat_id", 9)
            .kwarg("user_id", 4);
        assert_eq!(key.render(), "unread:[by_chat]:4:9");
    }
}
