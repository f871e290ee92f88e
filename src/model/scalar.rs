//! Typed scalar values and the closed index type enumeration

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// A typed scalar value carried by a record field.
///
/// The runtime representation is a tagged sum with an explicit per-variant
/// path for indexing, comparison and serialisation. Integer values are
/// carried as `i64`; an `INT`-declared schema field accepts them when they
/// fit `i32`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    /// 64-bit signed integer
    BigInt(i64),
    /// 64-bit float
    Decimal(f64),
    /// UTF-8 string
    Varchar(String),
}

impl Scalar {
    /// The index type produced by this runtime value.
    pub fn index_type(&self) -> IndexType {
        match self {
            Scalar::BigInt(_) => IndexType::BigInt,
            Scalar::Decimal(_) => IndexType::Decimal,
            Scalar::Varchar(_) => IndexType::Varchar,
        }
    }

    /// Whether this scalar is numeric (range-queryable).
    pub fn is_numeric(&self) -> bool {
        matches!(self, Scalar::BigInt(_) | Scalar::Decimal(_))
    }

    /// Numeric view, widening integers to `f64` for mixed comparisons.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Scalar::BigInt(v) => Some(*v as f64),
            Scalar::Decimal(v) => Some(*v),
            Scalar::Varchar(_) => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Scalar::BigInt(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Scalar::Varchar(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Total order within a type; numeric widening across numeric types.
    /// Numeric and string scalars are mutually incomparable.
    pub fn compare(&self, other: &Scalar) -> Option<Ordering> {
        match (self, other) {
            (Scalar::BigInt(a), Scalar::BigInt(b)) => Some(a.cmp(b)),
            (Scalar::Varchar(a), Scalar::Varchar(b)) => Some(a.cmp(b)),
            _ => {
                let a = self.as_f64()?;
                let b = other.as_f64()?;
                Some(a.total_cmp(&b))
            }
        }
    }

    /// Canonical string form, stable across process restarts. Used as the
    /// group key representation and for term indexing of non-string fields.
    pub fn key_repr(&self) -> String {
        match self {
            Scalar::BigInt(v) => v.to_string(),
            // Ryu-style shortest form via Display is canonical for f64
            Scalar::Decimal(v) => v.to_string(),
            Scalar::Varchar(s) => s.clone(),
        }
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::BigInt(v) => write!(f, "{v}"),
            Scalar::Decimal(v) => write!(f, "{v}"),
            Scalar::Varchar(s) => write!(f, "{s}"),
        }
    }
}

impl From<i64> for Scalar {
    fn from(v: i64) -> Self {
        Scalar::BigInt(v)
    }
}

impl From<f64> for Scalar {
    fn from(v: f64) -> Self {
        Scalar::Decimal(v)
    }
}

impl From<&str> for Scalar {
    fn from(v: &str) -> Self {
        Scalar::Varchar(v.to_string())
    }
}

impl From<String> for Scalar {
    fn from(v: String) -> Self {
        Scalar::Varchar(v)
    }
}

/// The closed enumeration of declared field types.
///
/// Persisted as a short stable tag string; never a class name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IndexType {
    #[serde(rename = "INT")]
    Int,
    #[serde(rename = "BIGINT")]
    BigInt,
    #[serde(rename = "DECIMAL")]
    Decimal,
    #[serde(rename = "VARCHAR")]
    Varchar,
}

impl IndexType {
    /// Stable persisted tag.
    pub fn tag(&self) -> &'static str {
        match self {
            IndexType::Int => "INT",
            IndexType::BigInt => "BIGINT",
            IndexType::Decimal => "DECIMAL",
            IndexType::Varchar => "VARCHAR",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "INT" => Some(IndexType::Int),
            "BIGINT" => Some(IndexType::BigInt),
            "DECIMAL" => Some(IndexType::Decimal),
            "VARCHAR" => Some(IndexType::Varchar),
            _ => None,
        }
    }

    pub fn is_numeric(&self) -> bool {
        !matches!(self, IndexType::Varchar)
    }

    /// Whether a runtime scalar satisfies this declared type.
    ///
    /// Integers are carried as `i64` at runtime, so `INT` accepts them when
    /// they fit the 32-bit range.
    pub fn accepts(&self, scalar: &Scalar) -> bool {
        match (self, scalar) {
            (IndexType::BigInt, Scalar::BigInt(_)) => true,
            (IndexType::Int, Scalar::BigInt(v)) => {
                *v >= i32::MIN as i64 && *v <= i32::MAX as i64
            }
            (IndexType::Decimal, Scalar::Decimal(_)) => true,
            (IndexType::Varchar, Scalar::Varchar(_)) => true,
            _ => false,
        }
    }
}

impl fmt::Display for IndexType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_ordering_widens_numerics() {
        assert_eq!(
            Scalar::BigInt(2).compare(&Scalar::Decimal(1.5)),
            Some(Ordering::Greater)
        );
        assert_eq!(
            Scalar::BigInt(3).compare(&Scalar::BigInt(3)),
            Some(Ordering::Equal)
        );
        assert_eq!(
            Scalar::Varchar("a".into()).compare(&Scalar::Varchar("b".into())),
            Some(Ordering::Less)
        );
        assert_eq!(Scalar::BigInt(1).compare(&Scalar::Varchar("1".into())), None);
    }

    #[test]
    fn untagged_json_round_trip() {
        let json = serde_json::to_string(&Scalar::BigInt(42)).unwrap();
        assert_eq!(json, "42");
        assert_eq!(serde_json::from_str::<Scalar>("42").unwrap(), Scalar::BigInt(42));
        assert_eq!(
            serde_json::from_str::<Scalar>("4.5").unwrap(),
            Scalar::Decimal(4.5)
        );
        assert_eq!(
            serde_json::from_str::<Scalar>("\"Doe\"").unwrap(),
            Scalar::Varchar("Doe".into())
        );
    }

    #[test]
    fn index_type_tags_round_trip() {
        for ty in [
            IndexType::Int,
            IndexType::BigInt,
            IndexType::Decimal,
            IndexType::Varchar,
        ] {
            assert_eq!(IndexType::from_tag(ty.tag()), Some(ty));
        }
        assert_eq!(IndexType::from_tag("BLOB"), None);
    }

    #[test]
    fn int_accepts_only_narrow_integers() {
        assert!(IndexType::Int.accepts(&Scalar::BigInt(7)));
        assert!(!IndexType::Int.accepts(&Scalar::BigInt(i64::MAX)));
        assert!(IndexType::BigInt.accepts(&Scalar::BigInt(i64::MAX)));
        assert!(!IndexType::Decimal.accepts(&Scalar::BigInt(1)));
    }
}
