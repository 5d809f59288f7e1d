use serde::{Deserialize, Serialize};

use crate::attribute_value::AttributeValue;
use crate::context::UserContext;

/// A single attribute comparison. Segments and experiment targeting share this grammar.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub attribute: String,
    #[serde(rename = "operator")]
    pub op: Op,
    pub value: AttributeValue,
    /// Declared type of `value`; when set, equality coerces both sides to it.
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub value_type: Option<ValueType>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Op {
    #[serde(alias = "==")]
    Equals,
    #[serde(alias = "!=")]
    NotEquals,
    #[serde(alias = ">")]
    GreaterThan,
    #[serde(alias = "<")]
    LessThan,
    #[serde(alias = ">=")]
    GreaterThanOrEqual,
    #[serde(alias = "<=")]
    LessThanOrEqual,
    Contains,
    StartsWith,
    EndsWith,
    In,
    NotIn,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueType {
    String,
    Number,
    #[serde(alias = "bool")]
    Boolean,
}

/// Returns true when every rule matches the context. An empty rule set matches everyone.
pub fn matches(rules: &[Rule], context: &UserContext) -> bool {
    // rules match if _all_ of them do
    rules.iter().all(|rule| rule.matches(context))
}

impl Rule {
    pub fn new(attribute: impl Into<String>, op: Op, value: impl Into<AttributeValue>) -> Self {
        Rule {
            attribute: attribute.into(),
            op,
            value: value.into(),
            value_type: None,
        }
    }

    pub fn typed(mut self, value_type: ValueType) -> Self {
        self.value_type = Some(value_type);
        self
    }

    /// Evaluation never fails: a missing attribute or a value that cannot be coerced for the
    /// operator is a non-match, except for the negated operators which it satisfies.
    pub fn matches(&self, context: &UserContext) -> bool {
        match context.value_of(&self.attribute) {
            Some(user_val) => self.op.matches(&user_val, &self.value, self.value_type),
            None => matches!(self.op, Op::NotEquals | Op::NotIn),
        }
    }
}

impl Op {
    fn matches(&self, lhs: &AttributeValue, rhs: &AttributeValue, ty: Option<ValueType>) -> bool {
        match self {
            Op::Equals => equals(lhs, rhs, ty),
            Op::NotEquals => !equals(lhs, rhs, ty),

            // numeric ops
            Op::GreaterThan => numeric_op(lhs, rhs, |l, r| l > r),
            Op::LessThan => numeric_op(lhs, rhs, |l, r| l < r),
            Op::GreaterThanOrEqual => numeric_op(lhs, rhs, |l, r| l >= r),
            Op::LessThanOrEqual => numeric_op(lhs, rhs, |l, r| l <= r),

            // string ops
            Op::Contains => string_op(lhs, rhs, |l, r| l.contains(r)),
            Op::StartsWith => string_op(lhs, rhs, |l, r| l.starts_with(r)),
            Op::EndsWith => string_op(lhs, rhs, |l, r| l.ends_with(r)),

            Op::In => in_list(lhs, rhs, ty),
            Op::NotIn => !in_list(lhs, rhs, ty),
        }
    }
}

fn equals(lhs: &AttributeValue, rhs: &AttributeValue, ty: Option<ValueType>) -> bool {
    match ty {
        Some(ValueType::Number) => numeric_op(lhs, rhs, |l, r| l == r),
        Some(ValueType::Boolean) => match (lhs.to_bool(), rhs.to_bool()) {
            (Some(l), Some(r)) => l == r,
            _ => false,
        },
        Some(ValueType::String) => lhs.to_display_string() == rhs.to_display_string(),
        None => lhs == rhs,
    }
}

fn in_list(lhs: &AttributeValue, rhs: &AttributeValue, ty: Option<ValueType>) -> bool {
    rhs.as_list()
        .iter()
        .any(|item| equals(lhs, item, ty) || lhs.loosely_equals(item))
}

fn string_op<F: Fn(&str, &str) -> bool>(lhs: &AttributeValue, rhs: &AttributeValue, f: F) -> bool {
    f(&lhs.to_display_string(), &rhs.to_display_string())
}

#[allow(clippy::float_cmp)]
fn numeric_op<F: Fn(f64, f64) -> bool>(lhs: &AttributeValue, rhs: &AttributeValue, f: F) -> bool {
    match (lhs.to_f64(), rhs.to_f64()) {
        (Some(l), Some(r)) => f(l, r),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use maplit::hashmap;
    use proptest::prelude::*;
    use test_case::test_case;

    use super::*;

    fn astring(s: &str) -> AttributeValue {
        AttributeValue::String(s.into())
    }
    fn anum(f: f64) -> AttributeValue {
        AttributeValue::Number(f)
    }

    #[test]
    fn test_op_equals() {
        assert!(Op::Equals.matches(&astring("foo"), &astring("foo"), None));
        assert!(!Op::Equals.matches(&astring("foo"), &astring("bar"), None));
        assert!(
            !Op::Equals.matches(&astring("Foo"), &astring("foo"), None),
            "case sensitive"
        );

        assert!(Op::Equals.matches(&anum(42.0), &anum(42.0), None));
        assert!(Op::Equals.matches(&anum(0.0), &anum(-0.0), None));
        assert!(
            !Op::Equals.matches(&astring("42"), &anum(42.0), None),
            "untyped equality does not coerce"
        );

        assert!(Op::NotEquals.matches(&astring("foo"), &astring("bar"), None));
        assert!(!Op::NotEquals.matches(&astring("foo"), &astring("foo"), None));
    }

    #[test]
    fn test_op_equals_typed() {
        assert!(Op::Equals.matches(&astring("42"), &anum(42.0), Some(ValueType::Number)));
        assert!(!Op::Equals.matches(&astring("x"), &anum(42.0), Some(ValueType::Number)));

        assert!(Op::Equals.matches(&astring("true"), &true.into(), Some(ValueType::Boolean)));
        assert!(!Op::Equals.matches(&astring("yes"), &true.into(), Some(ValueType::Boolean)));

        assert!(Op::Equals.matches(&anum(7.0), &astring("7"), Some(ValueType::String)));
    }

    #[test]
    fn test_op_starts_with() {
        // degenerate cases
        assert!(Op::StartsWith.matches(&astring(""), &astring(""), None));
        assert!(Op::StartsWith.matches(&astring("a"), &astring(""), None));
        assert!(Op::StartsWith.matches(&astring("a"), &astring("a"), None));

        // test asymmetry
        assert!(Op::StartsWith.matches(&astring("food"), &astring("foo"), None));
        assert!(!Op::StartsWith.matches(&astring("foo"), &astring("food"), None));

        assert!(
            !Op::StartsWith.matches(&astring("Food"), &astring("foo"), None),
            "case sensitive"
        );
    }

    #[test]
    fn test_op_ends_with() {
        assert!(Op::EndsWith.matches(&astring("a"), &astring(""), None));
        assert!(Op::EndsWith.matches(&astring("food"), &astring("ood"), None));
        assert!(!Op::EndsWith.matches(&astring("ood"), &astring("food"), None));
        assert!(Op::EndsWith.matches(
            &astring("jane@company.com"),
            &astring("@company.com"),
            None
        ));
    }

    #[test]
    fn test_op_contains() {
        assert!(Op::Contains.matches(&astring("food"), &astring("oo"), None));
        assert!(!Op::Contains.matches(&astring("oo"), &astring("food"), None));
        assert!(
            Op::Contains.matches(&anum(1234.0), &astring("23"), None),
            "compares string representations"
        );
    }

    #[test]
    fn test_ops_numeric() {
        assert!(Op::LessThan.matches(&anum(0.0), &anum(1.0), None));
        assert!(!Op::LessThan.matches(&anum(0.0), &anum(0.0), None));
        assert!(!Op::LessThan.matches(&anum(1.0), &anum(0.0), None));

        assert!(Op::GreaterThan.matches(&anum(1.0), &anum(0.0), None));
        assert!(!Op::GreaterThan.matches(&anum(0.0), &anum(0.0), None));

        assert!(Op::LessThanOrEqual.matches(&anum(0.0), &anum(0.0), None));
        assert!(!Op::LessThanOrEqual.matches(&anum(1.0), &anum(0.0), None));

        assert!(Op::GreaterThanOrEqual.matches(&anum(0.0), &anum(0.0), None));
        assert!(!Op::GreaterThanOrEqual.matches(&anum(0.0), &anum(1.0), None));

        // conversions
        assert!(
            Op::LessThan.matches(&astring("0"), &anum(1.0), None),
            "should convert numeric string on LHS"
        );
        assert!(
            Op::LessThan.matches(&anum(0.0), &astring("1"), None),
            "should convert numeric string on RHS"
        );
        assert!(
            !Op::LessThan.matches(&astring("Tuesday"), &anum(7.0), None),
            "non-numeric strings don't match"
        );
        assert!(
            !Op::GreaterThan.matches(&true.into(), &anum(0.0), None),
            "booleans are not numbers"
        );
    }

    #[test]
    fn test_ops_in() {
        let tiers: AttributeValue = vec!["premium", "enterprise"].into();
        assert!(Op::In.matches(&astring("premium"), &tiers, None));
        assert!(!Op::In.matches(&astring("free"), &tiers, None));
        assert!(Op::NotIn.matches(&astring("free"), &tiers, None));

        assert!(
            Op::In.matches(&anum(3.0), &vec!["1", "2", "3"].into(), None),
            "falls back to string equality"
        );
        assert!(
            Op::In.matches(&astring("solo"), &astring("solo"), None),
            "scalar rule values behave like a one element list"
        );
    }

    #[test_case("equals", Op::Equals)]
    #[test_case("==", Op::Equals)]
    #[test_case("!=", Op::NotEquals)]
    #[test_case(">", Op::GreaterThan)]
    #[test_case("<=", Op::LessThanOrEqual)]
    #[test_case("starts_with", Op::StartsWith)]
    #[test_case("not_in", Op::NotIn)]
    fn parses_operator(name: &str, expected: Op) {
        let op: Op = serde_json::from_value(serde_json::json!(name)).expect("should parse");
        assert_eq!(op, expected);
    }

    #[test]
    fn parses_rule() {
        let rule: Rule = serde_json::from_str(
            r#"{"attribute": "beta_user", "operator": "equals", "value": true, "type": "boolean"}"#,
        )
        .expect("should parse");
        assert_eq!(
            rule,
            Rule::new("beta_user", Op::Equals, true).typed(ValueType::Boolean)
        );
    }

    #[test]
    fn test_rule_matches() {
        let rule = Rule::new("plan", Op::Equals, "pro");

        let matching_user = UserContext::with_id("mu")
            .attributes(hashmap! {"plan".into() => "pro".into()})
            .build();
        let non_matching_user = UserContext::with_id("nmu")
            .attributes(hashmap! {"plan".into() => "free".into()})
            .build();
        let user_without_attr = UserContext::with_id("uwa").build();

        assert!(rule.matches(&matching_user));
        assert!(!rule.matches(&non_matching_user));
        assert!(!rule.matches(&user_without_attr));

        let negated = Rule::new("plan", Op::NotEquals, "pro");
        assert!(!negated.matches(&matching_user));
        assert!(negated.matches(&non_matching_user));
        assert!(
            negated.matches(&user_without_attr),
            "a missing attribute is not equal to anything"
        );

        let numeric = Rule::new("age", Op::GreaterThanOrEqual, 18_i64);
        assert!(
            !numeric.matches(&user_without_attr),
            "numeric operators never match a missing attribute"
        );
    }

    #[test]
    fn test_rule_matches_well_known_attributes() {
        let user = UserContext::with_id("u1")
            .email("jane@company.com")
            .country("BR")
            .build();

        assert!(Rule::new("user_id", Op::Equals, "u1").matches(&user));
        assert!(Rule::new("email", Op::EndsWith, "@company.com").matches(&user));
        assert!(Rule::new("country", Op::In, vec!["BR", "PT"]).matches(&user));
        assert!(!Rule::new("country", Op::NotIn, vec!["BR", "PT"]).matches(&user));
    }

    #[test]
    fn empty_rule_set_matches_everyone() {
        assert!(matches(&[], &UserContext::with_id("anyone").build()));
    }

    fn arb_user() -> impl Strategy<Value = UserContext> {
        (any::<u8>(), "[a-z]{0,3}").prop_map(|(age, plan)| {
            UserContext::with_id("u")
                .attribute("age", age as i64)
                .attribute("plan", plan)
                .build()
        })
    }

    fn arb_rule() -> impl Strategy<Value = Rule> {
        prop_oneof![
            (any::<u8>()).prop_map(|n| Rule::new("age", Op::GreaterThan, n as i64)),
            (any::<u8>()).prop_map(|n| Rule::new("age", Op::LessThanOrEqual, n as i64)),
            "[a-z]{0,2}".prop_map(|s| Rule::new("plan", Op::StartsWith, s)),
            "[a-z]{0,3}".prop_map(|s| Rule::new("plan", Op::NotEquals, s)),
        ]
    }

    proptest! {
        #[test]
        fn rule_sets_are_and_ed(user in arb_user(), a in arb_rule(), b in arb_rule()) {
            let both = matches(&[a.clone(), b.clone()], &user);
            prop_assert_eq!(both, a.matches(&user) && b.matches(&user));
        }
    }
}
