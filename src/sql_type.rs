//! Defines an enum of the SQL column affinities and routines for conversion to and from declared type names.
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// The column type affinities a stored column can carry.
/// `Numeric` exists so that declared types like `DECIMAL(20,6)` and `DATE`
/// get the catch-all affinity of the reference format rather than an error.
pub enum SqlType {
    Int,
    Text,
    Blob,
    Real,
    Numeric,
}

impl std::fmt::Display for SqlType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlType::Int => write!(f, "INT"),
            SqlType::Text => write!(f, "TEXT"),
            SqlType::Blob => write!(f, "BLOB"),
            SqlType::Real => write!(f, "REAL"),
            SqlType::Numeric => write!(f, "NUMERIC"),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct ParseSqlTypeError;

impl FromStr for SqlType {
    type Err = ParseSqlTypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "INT" | "INTEGER" => Ok(SqlType::Int),
            "TEXT" => Ok(SqlType::Text),
            "BLOB" => Ok(SqlType::Blob),
            "REAL" => Ok(SqlType::Real),
            "NUMERIC" => Ok(SqlType::Numeric),
            _ => Err(ParseSqlTypeError),
        }
    }
}

/// Derives the affinity of a declared column type, following the
/// substring rules of the reference format:
/// 1. contains "INT" -> Int
/// 2. contains "CHAR", "CLOB" or "TEXT" -> Text
/// 3. contains "BLOB" or is empty -> Blob
/// 4. contains "REAL", "FLOA" or "DOUB" -> Real
/// 5. otherwise -> Numeric
pub fn affinity_of_declared_type(declared: &str) -> SqlType {
    let d = declared.to_uppercase();
    if d.contains("INT") {
        SqlType::Int
    } else if d.contains("CHAR") || d.contains("CLOB") || d.contains("TEXT") {
        SqlType::Text
    } else if d.is_empty() || d.contains("BLOB") {
        SqlType::Blob
    } else if d.contains("REAL") || d.contains("FLOA") || d.contains("DOUB") {
        SqlType::Real
    } else {
        SqlType::Numeric
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_affinity_rules() {
        assert_eq!(affinity_of_declared_type("INTEGER"), SqlType::Int);
        assert_eq!(affinity_of_declared_type("TINYINT"), SqlType::Int);
        assert_eq!(affinity_of_declared_type("VARCHAR(80)"), SqlType::Text);
        assert_eq!(affinity_of_declared_type("text"), SqlType::Text);
        assert_eq!(affinity_of_declared_type("BLOB"), SqlType::Blob);
        assert_eq!(affinity_of_declared_type(""), SqlType::Blob);
        assert_eq!(affinity_of_declared_type("DOUBLE PRECISION"), SqlType::Real);
        assert_eq!(affinity_of_declared_type("DECIMAL(20,6)"), SqlType::Numeric);
        assert_eq!(affinity_of_declared_type("DATE"), SqlType::Numeric);
    }
}
