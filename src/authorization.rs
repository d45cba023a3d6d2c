//! Scope based access control.

use std::fmt;

use crate::token::Claims;

/// Outcome of [`authorize`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Granted,
    /// Required scopes absent from the token, sorted and without duplicates.
    Denied(Vec<String>),
}

impl Decision {
    pub fn is_granted(&self) -> bool {
        matches!(self, Decision::Granted)
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Decision::Granted => f.write_str("granted"),
            Decision::Denied(missing) => {
                write!(f, "missing scopes: {}", missing.join(", "))
            },
        }
    }
}

/// Check that every `required` scope is granted by `claims`.
///
/// Comparison is exact and case-sensitive. An empty requirement is always
/// granted.
pub fn authorize<I, S>(claims: &Claims, required: I) -> Decision
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut missing: Vec<String> = required
        .into_iter()
        .filter(|scope| !claims.scopes.contains(scope.as_ref()))
        .map(|scope| scope.as_ref().to_owned())
        .collect();

    if missing.is_empty() {
        return Decision::Granted;
    }

    missing.sort_unstable();
    missing.dedup();
    Decision::Denied(missing)
}
