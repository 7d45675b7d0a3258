/// Type definitions of a low-level SQL string representation.
#[derive(Debug, Clone, PartialEq)]
pub struct SQL {
    pub sql: String,
    pub params: Vec<Param>,
    /// for internal use and tests only
    pub param_index: u64,
}

impl Default for SQL {
    fn default() -> Self {
        Self::new()
    }
}

/// A parameter for a parameterized query, bound by position.
#[derive(Debug, Clone, PartialEq)]
pub enum Param {
    /// A literal string
    String(String),
    /// A 64-bit integer
    Int(i64),
    /// A double-precision float
    Float(f64),
    /// A json value, bound as jsonb
    Json(serde_json::Value),
    /// A text array, bound as text[]
    StringArray(Vec<String>),
}

/// A DDL statement.
#[derive(Debug)]
pub struct DDL(pub SQL);

impl SQL {
    pub fn new() -> SQL {
        SQL {
            sql: String::new(),
            params: vec![],
            param_index: 0,
        }
    }

    /// Append a fragment of SQL syntax. Must never carry user data.
    pub fn append_syntax(&mut self, sql: &str) {
        self.sql.push_str(sql);
    }

    /// Append a quoted identifier, doubling any embedded quote characters.
    pub fn append_identifier(&mut self, name: &str) {
        self.sql.push('"');
        self.sql.push_str(&name.replace('"', "\"\""));
        self.sql.push('"');
    }

    /// Append a positional placeholder and record its parameter.
    pub fn append_param(&mut self, param: Param) {
        self.param_index += 1;
        self.sql.push_str(format!("${}", self.param_index).as_str());
        self.params.push(param);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholders_track_params() {
        let mut sql = SQL::new();
        sql.append_identifier("name");
        sql.append_syntax(" = ");
        sql.append_param(Param::String("x".to_string()));
        sql.append_syntax(" AND ");
        sql.append_identifier("age");
        sql.append_syntax(" = ");
        sql.append_param(Param::Float(1.0));
        assert_eq!(sql.sql, "\"name\" = $1 AND \"age\" = $2");
        assert_eq!(sql.params.len(), 2);
    }

    #[test]
    fn identifiers_are_quote_escaped() {
        let mut sql = SQL::new();
        sql.append_identifier("na\"me");
        assert_eq!(sql.sql, "\"na\"\"me\"");
    }
}
