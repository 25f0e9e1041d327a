//! Preservation categories and user data items

use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};

/// Category of user-owned data that must survive a tier change
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    /// Session memories
    SessionMemory,
    /// Conversation history entries
    ConversationEntry,
    /// Learning insights
    LearningInsight,
    /// Saved reports
    SavedReport,
    /// Dashboard layout
    DashboardLayout,
}

impl Category {
    /// Every preservation category, in capture order
    pub const ALL: [Category; 5] = [
        Category::SessionMemory,
        Category::ConversationEntry,
        Category::LearningInsight,
        Category::SavedReport,
        Category::DashboardLayout,
    ];

    /// Stable name
    #[inline]
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Category::SessionMemory => "session_memory",
            Category::ConversationEntry => "conversation_entry",
            Category::LearningInsight => "learning_insight",
            Category::SavedReport => "saved_report",
            Category::DashboardLayout => "dashboard_layout",
        }
    }
}

impl Display for Category {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Address of one data item: category plus identifier within it
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ItemKey {
    /// Category
    pub category: Category,
    /// Identifier within the category
    pub identifier: String,
}

impl ItemKey {
    /// Create an item key
    #[inline]
    #[must_use]
    pub fn new(category: Category, identifier: impl Into<String>) -> Self {
        Self {
            category,
            identifier: identifier.into(),
        }
    }
}

impl Display for ItemKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.category, self.identifier)
    }
}

/// A live data item as held by the data store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredItem {
    /// Item address
    pub key: ItemKey,
    /// Item payload
    pub payload: serde_json::Value,
}

impl StoredItem {
    /// Create a stored item
    #[inline]
    #[must_use]
    pub fn new(key: ItemKey, payload: serde_json::Value) -> Self {
        Self { key, payload }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn item_key_display() {
        let key = ItemKey::new(Category::SavedReport, "q3-revenue");
        assert_eq!(key.to_string(), "saved_report/q3-revenue");
    }

    #[test]
    fn item_keys_order_by_category_first() {
        let a = ItemKey::new(Category::SessionMemory, "z");
        let b = ItemKey::new(Category::DashboardLayout, "a");
        assert!(a < b);
    }
}
