use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::attribute_value::{AttributeValue, Attributes};

/// The attributes of the user a flag is evaluated for.
///
/// `user_id` is the identity used for bucketing: every hash-based decision (experiment traffic,
/// variant selection, rollout percentage) is a pure function of it. The well-known attributes
/// `user_id`, `email` and `country` can be referenced by rules under those names; anything else
/// is looked up in the open attribute map.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct UserContext {
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub attributes: Attributes,
}

impl UserContext {
    pub fn with_id(user_id: impl Into<String>) -> UserContextBuilder {
        UserContextBuilder::new(user_id)
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Resolves a rule attribute name against this context. Returns None when the attribute is
    /// absent, which rules treat as a non-match for every operator except the negated ones.
    pub fn value_of(&self, attr: &str) -> Option<AttributeValue> {
        match attr {
            "user_id" => Some(AttributeValue::String(self.user_id.clone())),
            "email" => self.email.clone().map(AttributeValue::String),
            "country" => self.country.clone().map(AttributeValue::String),
            _ => self
                .attributes
                .get(attr)
                .filter(|value| !value.is_null())
                .cloned(),
        }
    }
}

/// Contains methods for configuring a [UserContext].
pub struct UserContextBuilder {
    user_id: String,
    email: Option<String>,
    country: Option<String>,
    attributes: Attributes,
}

impl UserContextBuilder {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            email: None,
            country: None,
            attributes: HashMap::new(),
        }
    }

    pub fn email(&mut self, email: impl Into<String>) -> &mut Self {
        self.email = Some(email.into());
        self
    }

    pub fn country(&mut self, country: impl Into<String>) -> &mut Self {
        self.country = Some(country.into());
        self
    }

    /// Sets a single custom attribute, replacing any previous value.
    pub fn attribute(
        &mut self,
        key: impl Into<String>,
        value: impl Into<AttributeValue>,
    ) -> &mut Self {
        let _ = self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn attributes(&mut self, attributes: Attributes) -> &mut Self {
        self.attributes.extend(attributes);
        self
    }

    pub fn build(&self) -> UserContext {
        UserContext {
            user_id: self.user_id.clone(),
            email: self.email.clone(),
            country: self.country.clone(),
            attributes: self.attributes.clone(),
        }
    }
}
