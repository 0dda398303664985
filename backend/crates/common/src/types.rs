use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// A remote collection mirrored into the local store.
///
/// Top-level types are synchronised by their own worker. `Transactions` is a
/// child collection of `Orders` and is only pulled while syncing orders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    Orders,
    Products,
    CustomCollections,
    SmartCollections,
    Pages,
    Blogs,
    Customers,
    Transactions,
}

impl ResourceType {
    /// Every type that can be requested for a run.
    pub const TOP_LEVEL: [ResourceType; 7] = [
        Self::Orders,
        Self::Products,
        Self::CustomCollections,
        Self::SmartCollections,
        Self::Pages,
        Self::Blogs,
        Self::Customers,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Orders => "orders",
            Self::Products => "products",
            Self::CustomCollections => "custom_collections",
            Self::SmartCollections => "smart_collections",
            Self::Pages => "pages",
            Self::Blogs => "blogs",
            Self::Customers => "customers",
            Self::Transactions => "transactions",
        }
    }

    /// Key of the JSON array in a list response, e.g. `{"orders": [...]}`.
    pub fn envelope(&self) -> &'static str {
        self.as_str()
    }

    /// Field holding the human readable label of one item.
    pub fn label_field(&self) -> &'static str {
        match self {
            Self::Orders => "name",
            Self::Customers => "email",
            Self::Transactions => "kind",
            Self::Products
            | Self::CustomCollections
            | Self::SmartCollections
            | Self::Pages
            | Self::Blogs => "title",
        }
    }

    pub fn parent(&self) -> Option<ResourceType> {
        match self {
            Self::Transactions => Some(Self::Orders),
            _ => None,
        }
    }

    pub fn is_child(&self) -> bool {
        self.parent().is_some()
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceType {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "orders" => Ok(Self::Orders),
            "products" => Ok(Self::Products),
            "custom_collections" => Ok(Self::CustomCollections),
            "smart_collections" => Ok(Self::SmartCollections),
            "pages" => Ok(Self::Pages),
            "blogs" => Ok(Self::Blogs),
            "customers" => Ok(Self::Customers),
            "transactions" => Ok(Self::Transactions),
            _ => Err(format!("unknown resource type: {value}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn as_str_and_from_str_agree() {
        for resource in ResourceType::TOP_LEVEL {
            assert_eq!(resource.as_str().parse::<ResourceType>(), Ok(resource));
        }
        assert_eq!("transactions".parse(), Ok(ResourceType::Transactions));
    }

    #[test]
    fn unknown_resource_is_rejected() {
        let err = "themes".parse::<ResourceType>().unwrap_err();
        assert!(err.contains("themes"), "got: {err}");
    }

    #[test]
    fn transactions_are_children_of_orders() {
        assert_eq!(ResourceType::Transactions.parent(), Some(ResourceType::Orders));
        assert!(ResourceType::Transactions.is_child());
        assert!(!ResourceType::TOP_LEVEL.iter().any(|r| r.is_child()));
    }

    #[test]
    fn serde_uses_snake_case() {
        let json = serde_json::to_string(&ResourceType::SmartCollections).unwrap();
        assert_eq!(json, "\"smart_collections\"");
    }

    #[test]
    fn label_fields() {
        assert_eq!(ResourceType::Orders.label_field(), "name");
        assert_eq!(ResourceType::Pages.label_field(), "title");
        assert_eq!(ResourceType::Customers.label_field(), "email");
    }
}
