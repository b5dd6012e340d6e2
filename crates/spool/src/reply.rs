use std::fmt;

/// One `!name<?|=> code [: field]* ;` reply. Code 0 success, 1 initiated,
/// 2 wrong device class, 4 runtime failure, 5 busy, 6 precondition not
/// met, 8 argument error.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Reply {
    pub name: String,
    pub query: bool,
    pub code: u8,
    pub fields: Vec<String>,
}

impl Reply {
    pub fn new(name: &str, query: bool, code: u8) -> Self {
        Reply { name: name.to_string(), query, code, fields: Vec::new() }
    }

    pub fn with(mut self, field: impl fmt::Display) -> Self {
        self.fields.push(field.to_string());
        self
    }

    pub fn ok(name: &str, query: bool) -> Self {
        Reply::new(name, query, 0)
    }

    pub fn initiated(name: &str, query: bool) -> Self {
        Reply::new(name, query, 1)
    }

    pub fn wrong_class(name: &str, query: bool) -> Self {
        Reply::new(name, query, 2).with("not applicable to this device")
    }

    pub fn failed(name: &str, query: bool, why: impl fmt::Display) -> Self {
        Reply::new(name, query, 4).with(why)
    }

    pub fn busy(name: &str, query: bool) -> Self {
        Reply::new(name, query, 5)
    }

    pub fn precondition(name: &str, query: bool, why: impl fmt::Display) -> Self {
        Reply::new(name, query, 6).with(why)
    }

    pub fn bad_arg(name: &str, query: bool, why: impl fmt::Display) -> Self {
        Reply::new(name, query, 8).with(why)
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "!{}{} {}", self.name, if self.query { '?' } else { '=' }, self.code)?;
        for field in &self.fields {
            write!(f, " : {field}")?;
        }
        write!(f, " ;")
    }
}
