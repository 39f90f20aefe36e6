use crate::Value;

/// Predicate operators supported by scans.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PredicateOp {
    Equals,
    GreaterThan,
}

impl PredicateOp {
    /// Do predicate comparison.
    ///
    /// # Arguments
    ///
    /// * `left_field` - Left field of the predicate.
    /// * `right_field` - Right field of the predicate.
    pub fn compare<T: Ord>(&self, left_field: &T, right_field: &T) -> bool {
        match self {
            PredicateOp::Equals => left_field == right_field,
            PredicateOp::GreaterThan => left_field > right_field,
        }
    }
}

/// A parsed select-project-join query. Columns are named `alias.field`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Query {
    /// Table names, parallel to `aliases`.
    pub tables: Vec<String>,
    pub aliases: Vec<String>,
    /// Columns returned to the caller, in order.
    pub output_fields: Vec<String>,
    /// `column = literal` restrictions.
    pub eq_restrictions: Vec<(String, Value)>,
    /// `column > literal` restrictions.
    pub gt_restrictions: Vec<(String, Value)>,
    /// `column = column` join predicates.
    pub join_fields: Vec<(String, String)>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a table under an alias.
    pub fn table(mut self, name: &str, alias: &str) -> Self {
        self.tables.push(name.to_string());
        self.aliases.push(alias.to_string());
        self
    }

    pub fn output(mut self, col: &str) -> Self {
        self.output_fields.push(col.to_string());
        self
    }

    pub fn eq(mut self, col: &str, value: Value) -> Self {
        self.eq_restrictions.push((col.to_string(), value));
        self
    }

    pub fn gt(mut self, col: &str, value: Value) -> Self {
        self.gt_restrictions.push((col.to_string(), value));
        self
    }

    pub fn join(mut self, left: &str, right: &str) -> Self {
        self.join_fields.push((left.to_string(), right.to_string()));
        self
    }

    /// All literal restrictions with their operator.
    pub fn restrictions(&self) -> impl Iterator<Item = (&str, &Value, PredicateOp)> {
        self.eq_restrictions
            .iter()
            .map(|(c, v)| (c.as_str(), v, PredicateOp::Equals))
            .chain(
                self.gt_restrictions
                    .iter()
                    .map(|(c, v)| (c.as_str(), v, PredicateOp::GreaterThan)),
            )
    }

    /// Alias of the table a query column belongs to.
    pub fn alias_of(col: &str) -> &str {
        match col.find('.') {
            Some(pos) => &col[..pos],
            None => col,
        }
    }

    /// Field part of a query column.
    pub fn field_of(col: &str) -> &str {
        match col.find('.') {
            Some(pos) => &col[pos + 1..],
            None => "",
        }
    }
}

/// True when `col` names `alias` or one of its fields.
pub fn belongs_to(col: &str, alias: &str) -> bool {
    col.len() >= alias.len()
        && col.starts_with(alias)
        && (col.len() == alias.len() || col.as_bytes()[alias.len()] == b'.')
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_column_names() {
        assert_eq!("a", Query::alias_of("a._id"));
        assert_eq!("_id", Query::field_of("a._id"));
        assert!(belongs_to("a._id", "a"));
        assert!(belongs_to("a", "a"));
        assert!(!belongs_to("ab._id", "a"));
    }

    #[test]
    fn test_builder() {
        let q = Query::new()
            .table("T", "a")
            .output("a._id")
            .gt("a.v", Value::Int(15))
            .eq("a._id", Value::Int(2));
        let ops: Vec<PredicateOp> = q.restrictions().map(|r| r.2).collect();
        assert_eq!(vec![PredicateOp::Equals, PredicateOp::GreaterThan], ops);
        assert!(PredicateOp::GreaterThan.compare(&3, &2));
    }
}
