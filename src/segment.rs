use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::context::UserContext;
use crate::error::{Result, ValidationError};
use crate::rule::{self, Op, Rule, ValueType};

/// A named subset of users. Membership is a pure function of the user context: a user is in the
/// segment when every rule matches, and nothing about membership is stored.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UserSegment {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub rules: Vec<Rule>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl UserSegment {
    pub fn new(id: impl Into<String>, name: impl Into<String>, rules: Vec<Rule>) -> Self {
        let now = Utc::now();
        UserSegment {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            rules,
            tags: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn contains(&self, context: &UserContext) -> bool {
        rule::matches(&self.rules, context)
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(ValidationError::MissingSegmentId.into());
        }
        Ok(())
    }
}

/// The segments every engine starts with unless configured otherwise.
pub fn default_segments() -> Vec<UserSegment> {
    vec![
        UserSegment {
            description: "Internal company users".into(),
            tags: vec!["internal".into(), "staff".into()],
            ..UserSegment::new(
                "internal_users",
                "Internal Users",
                vec![Rule::new("email", Op::EndsWith, "@company.com").typed(ValueType::String)],
            )
        },
        UserSegment {
            description: "Users enrolled in beta program".into(),
            tags: vec!["beta".into(), "early_adopters".into()],
            ..UserSegment::new(
                "beta_users",
                "Beta Users",
                vec![Rule::new("beta_user", Op::Equals, true).typed(ValueType::Boolean)],
            )
        },
        UserSegment {
            description: "Users with premium subscription".into(),
            tags: vec!["premium".into(), "paid".into()],
            ..UserSegment::new(
                "premium_users",
                "Premium Users",
                vec![Rule::new(
                    "subscription_tier",
                    Op::In,
                    vec!["premium", "enterprise"],
                )
                .typed(ValueType::String)],
            )
        },
    ]
}
