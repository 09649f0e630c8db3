use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for an order.
///
/// Wraps a UUID so order ids cannot be mixed up with the opaque string
/// identifiers handed out by the payment and fulfillment providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrderId(Uuid);

impl OrderId {
    /// Creates a new random order ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates an order ID from an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for OrderId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for OrderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for OrderId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl From<OrderId> for Uuid {
    fn from(id: OrderId) -> Self {
        id.0
    }
}

/// Error returned when a string is not a valid order ID.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseOrderIdError(String);

impl std::fmt::Display for ParseOrderIdError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid order id: {}", self.0)
    }
}

impl std::error::Error for ParseOrderIdError {}

impl std::str::FromStr for OrderId {
    type Err = ParseOrderIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim())
            .map(Self)
            .map_err(|_| ParseOrderIdError(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ID: &str = "67e55044-10b1-426f-9247-bb680e5fe0c8";

    #[test]
    fn parses_what_display_prints() {
        let id = OrderId::new();
        assert_eq!(id.to_string().parse::<OrderId>(), Ok(id));
        assert_ne!(OrderId::new(), id);
    }

    #[test]
    fn parse_trims_whitespace_and_ignores_case() {
        let expected: OrderId = ID.parse().unwrap();
        assert_eq!(format!("  {ID}\n").parse::<OrderId>(), Ok(expected));
        assert_eq!(ID.to_uppercase().parse::<OrderId>(), Ok(expected));
        assert_eq!(expected.to_string(), ID);
    }

    #[test]
    fn parse_rejects_invalid_input() {
        let too_long = format!("{ID}0");
        let inputs: [&str; 6] = ["", "   ", "not-a-uuid", &ID[..35], &too_long, "cs_test_123"];
        for input in inputs {
            let err = input.parse::<OrderId>().unwrap_err();
            assert_eq!(err.to_string(), format!("invalid order id: {input}"));
        }
    }

    #[test]
    fn serializes_as_plain_string() {
        let id: OrderId = ID.parse().unwrap();
        assert_eq!(serde_json::to_string(&id).unwrap(), format!("\"{ID}\""));
        assert_eq!(serde_json::from_str::<OrderId>(&format!("\"{ID}\"")).unwrap(), id);
        assert!(serde_json::from_str::<OrderId>("\"cs_test_123\"").is_err());
    }
}
