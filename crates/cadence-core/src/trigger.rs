//! The trigger abstraction: a value that computes future occurrence
//! timestamps from a schedule rule, plus the global builder registry and
//! interning cache that deduplicate triggers by (scheme, expression).

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, OnceLock};

use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::cron::CronBuilder;
use crate::error::{Result, TriggerError};

/// Computes occurrence timestamps for a trigger.
///
/// Implementations must return the earliest matching timestamp strictly
/// after `origin`, or `origin` itself when `inclusive` is set and it
/// matches. `None` means the rule will never fire again and the trigger is
/// permanently exhausted.
pub trait OccurrenceRule: Send + Sync {
    fn next_occurrence(&self, origin: DateTime<Utc>, inclusive: bool) -> Option<DateTime<Utc>>;
}

/// Builds a [`Trigger`] from an expression string for one scheme.
///
/// Register custom builders with [`register`]; the `"cron"` scheme is
/// pre-registered.
pub trait TriggerBuilder: Send + Sync {
    fn build(&self, expression: &str) -> Result<Trigger>;
}

/// An immutable time-based trigger.
///
/// Identity (equality and hashing) is the pair (scheme, normalized
/// expression text) — two triggers of different kinds or different
/// expression text are never equal, even if they would produce identical
/// occurrence sequences.
#[derive(Clone)]
pub struct Trigger {
    scheme: String,
    expression: String,
    rule: Arc<dyn OccurrenceRule>,
}

impl Trigger {
    /// Wrap a rule in a trigger value. The scheme is folded to lowercase.
    pub fn new(
        scheme: impl Into<String>,
        expression: impl Into<String>,
        rule: Arc<dyn OccurrenceRule>,
    ) -> Self {
        Self {
            scheme: scheme.into().trim().to_lowercase(),
            expression: expression.into(),
            rule,
        }
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    /// The normalized expression text this trigger was built from.
    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// Next occurrence computed from the current time.
    pub fn next_occurrence(&self, inclusive: bool) -> Option<DateTime<Utc>> {
        self.rule.next_occurrence(Utc::now(), inclusive)
    }

    /// Next occurrence computed from an explicit origin.
    pub fn next_occurrence_from(
        &self,
        origin: DateTime<Utc>,
        inclusive: bool,
    ) -> Option<DateTime<Utc>> {
        self.rule.next_occurrence(origin, inclusive)
    }
}

impl PartialEq for Trigger {
    fn eq(&self, other: &Self) -> bool {
        self.scheme == other.scheme && self.expression == other.expression
    }
}

impl Eq for Trigger {}

impl Hash for Trigger {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.scheme.hash(state);
        self.expression.hash(state);
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.scheme, self.expression)
    }
}

impl fmt::Debug for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Trigger({}:{})", self.scheme, self.expression)
    }
}

/// Scheme -> builder registry. Populated lazily with the cron builder.
fn builders() -> &'static DashMap<String, Arc<dyn TriggerBuilder>> {
    static BUILDERS: OnceLock<DashMap<String, Arc<dyn TriggerBuilder>>> = OnceLock::new();
    BUILDERS.get_or_init(|| {
        let map: DashMap<String, Arc<dyn TriggerBuilder>> = DashMap::new();
        map.insert("cron".to_string(), Arc::new(CronBuilder));
        map
    })
}

/// (scheme, raw expression) -> trigger interning cache, so identical
/// expressions reuse the same rule instance.
fn cache() -> &'static DashMap<String, Trigger> {
    static CACHE: OnceLock<DashMap<String, Trigger>> = OnceLock::new();
    CACHE.get_or_init(DashMap::new)
}

/// Register a builder for a scheme, replacing any existing one.
pub fn register(scheme: &str, builder: Arc<dyn TriggerBuilder>) {
    builders().insert(scheme.trim().to_lowercase(), builder);
}

/// Resolve (and intern) a trigger for the given scheme and expression.
pub fn get(scheme: &str, expression: &str) -> Result<Trigger> {
    let scheme = scheme.trim().to_lowercase();
    if scheme.is_empty() {
        return Err(TriggerError::UnknownScheme { scheme });
    }
    if expression.trim().is_empty() {
        return Err(TriggerError::EmptyExpression);
    }

    let key = format!("{scheme}:{expression}");
    if let Some(trigger) = cache().get(&key) {
        return Ok(trigger.clone());
    }

    let builder = builders()
        .get(&scheme)
        .map(|entry| Arc::clone(entry.value()))
        .ok_or_else(|| TriggerError::UnknownScheme {
            scheme: scheme.clone(),
        })?;
    let trigger = builder.build(expression)?;

    // A concurrent caller may have inserted first; the entry API keeps
    // exactly one winner so interning stays stable.
    Ok(cache().entry(key).or_insert(trigger).clone())
}

/// Shorthand for [`get`] with the `"cron"` scheme.
pub fn cron(expression: &str) -> Result<Trigger> {
    get("cron", expression)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NeverRule;

    impl OccurrenceRule for NeverRule {
        fn next_occurrence(&self, _: DateTime<Utc>, _: bool) -> Option<DateTime<Utc>> {
            None
        }
    }

    struct EchoBuilder;

    impl TriggerBuilder for EchoBuilder {
        fn build(&self, expression: &str) -> Result<Trigger> {
            Ok(Trigger::new("echo", expression, Arc::new(NeverRule)))
        }
    }

    #[test]
    fn equality_is_scheme_plus_expression() {
        let a = Trigger::new("test", "x", Arc::new(NeverRule));
        let b = Trigger::new("test", "x", Arc::new(NeverRule));
        let c = Trigger::new("test", "y", Arc::new(NeverRule));
        let d = Trigger::new("other", "x", Arc::new(NeverRule));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
    }

    #[test]
    fn scheme_is_case_folded() {
        let a = Trigger::new("Test", "x", Arc::new(NeverRule));
        let b = Trigger::new("test", "x", Arc::new(NeverRule));
        assert_eq!(a, b);
        assert_eq!(a.scheme(), "test");
    }

    #[test]
    fn interning_reuses_the_same_rule() {
        let a = cron("0 30 9 * * *").unwrap();
        let b = cron("0 30 9 * * *").unwrap();
        assert_eq!(a, b);
        assert!(Arc::ptr_eq(&a.rule, &b.rule));
    }

    #[test]
    fn unknown_scheme_is_rejected() {
        let err = get("nope", "whatever").unwrap_err();
        assert!(matches!(err, TriggerError::UnknownScheme { .. }));
    }

    #[test]
    fn blank_expression_is_rejected() {
        let err = get("cron", "   ").unwrap_err();
        assert!(matches!(err, TriggerError::EmptyExpression));
    }

    #[test]
    fn custom_builder_can_be_registered() {
        register("echo", Arc::new(EchoBuilder));
        let trigger = get("echo", "anything").unwrap();
        assert_eq!(trigger.scheme(), "echo");
        assert_eq!(trigger.expression(), "anything");
    }
}
