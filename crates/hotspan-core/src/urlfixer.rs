//! URL fixer pipeline.
//!
//! Some client firmware produces request targets the wider internet refuses
//! to parse. Rather than rejecting those sessions, the proxy runs every
//! outbound target through an ordered pipeline of narrow rewrite rules.
//! Rules are stateless and total: a rule that does not recognize the input
//! returns it unchanged, and every registered rule sees the previous rule's
//! output.

use std::sync::Arc;

/// A single rewrite rule for outbound request targets.
pub trait UrlFixer: Send + Sync {
    /// Short name for diagnostics.
    fn name(&self) -> &'static str;

    /// Returns the possibly-rewritten target. Must be side-effect-free and
    /// never fail; unrecognized input comes back unchanged.
    fn fix(&self, target: &str) -> String;
}

/// Ordered set of rewrite rules applied to every outbound target.
#[derive(Clone, Default)]
pub struct FixerPipeline {
    fixers: Vec<Arc<dyn UrlFixer>>,
}

impl FixerPipeline {
    /// Creates an empty pipeline that passes targets through untouched.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Creates the standard pipeline with the bundled rules.
    pub fn standard() -> Self {
        Self::empty().with_fixer(PsnUrlFixer)
    }

    /// Appends a rule; rules run in registration order.
    #[must_use]
    pub fn with_fixer(mut self, fixer: impl UrlFixer + 'static) -> Self {
        self.fixers.push(Arc::new(fixer));
        self
    }

    /// Runs every rule in order, feeding each rule's output to the next.
    pub fn apply(&self, target: &str) -> String {
        let mut current = target.to_string();
        for fixer in &self.fixers {
            let fixed = fixer.fix(&current);
            if fixed != current {
                tracing::debug!("Fixer {} rewrote target {:?} -> {:?}", fixer.name(), current, fixed);
                current = fixed;
            }
        }
        current
    }

    /// Number of registered rules.
    pub fn len(&self) -> usize {
        self.fixers.len()
    }

    /// Returns true if no rules are registered.
    pub fn is_empty(&self) -> bool {
        self.fixers.is_empty()
    }
}

impl std::fmt::Debug for FixerPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FixerPipeline")
            .field("fixers", &self.fixers.iter().map(|x| x.name()).collect::<Vec<_>>())
            .finish()
    }
}

/// Repairs request targets produced by PlayStation console firmware.
///
/// The console store client is known to emit absolute URLs with literal
/// spaces in the path and a doubled slash after the authority; both are
/// refused by strict upstream servers.
#[derive(Debug, Clone, Copy)]
pub struct PsnUrlFixer;

impl UrlFixer for PsnUrlFixer {
    fn name(&self) -> &'static str {
        "psn"
    }

    fn fix(&self, target: &str) -> String {
        let (scheme, rest) = match target.split_once("://") {
            Some((scheme, rest)) => (scheme, rest),
            None => return target.to_string(),
        };

        let (authority, path) = match rest.split_once('/') {
            Some((authority, path)) => (authority, path),
            None => return target.to_string(),
        };

        // Collapse the doubled slash the console inserts after the host and
        // percent-encode literal spaces in the path.
        let path = path.trim_start_matches('/');
        let path = path.replace(' ', "%20");
        format!("{scheme}://{authority}/{path}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Upcase;

    impl UrlFixer for Upcase {
        fn name(&self) -> &'static str {
            "upcase"
        }

        fn fix(&self, target: &str) -> String {
            target.to_uppercase()
        }
    }

    struct TrimX;

    impl UrlFixer for TrimX {
        fn name(&self) -> &'static str {
            "trim-x"
        }

        fn fix(&self, target: &str) -> String {
            target.trim_end_matches('X').to_string()
        }
    }

    #[test]
    fn empty_pipeline_passes_through() {
        let pipeline = FixerPipeline::empty();
        assert_eq!(pipeline.apply("http://example.com/a b"), "http://example.com/a b");
        assert!(pipeline.is_empty());
    }

    #[test]
    fn rules_run_in_registration_order() {
        // Upcase then TrimX strips the (now uppercase) trailing x.
        let pipeline = FixerPipeline::empty().with_fixer(Upcase).with_fixer(TrimX);
        assert_eq!(pipeline.apply("abcx"), "ABC");

        // Reversed order leaves the lowercase x untouched before upcasing.
        let pipeline = FixerPipeline::empty().with_fixer(TrimX).with_fixer(Upcase);
        assert_eq!(pipeline.apply("abcx"), "ABCX");
    }

    #[test]
    fn psn_fixer_encodes_spaces() {
        let fixer = PsnUrlFixer;
        assert_eq!(
            fixer.fix("http://store.example.com/title/cool game"),
            "http://store.example.com/title/cool%20game"
        );
    }

    #[test]
    fn psn_fixer_collapses_doubled_slash() {
        let fixer = PsnUrlFixer;
        assert_eq!(
            fixer.fix("http://store.example.com//title/game"),
            "http://store.example.com/title/game"
        );
    }

    #[test]
    fn psn_fixer_leaves_plain_targets_alone() {
        let fixer = PsnUrlFixer;
        assert_eq!(fixer.fix("example.com:443"), "example.com:443");
        assert_eq!(
            fixer.fix("http://example.com/ok/path"),
            "http://example.com/ok/path"
        );
    }

    #[test]
    fn standard_pipeline_is_idempotent() {
        let pipeline = FixerPipeline::standard();
        let inputs = [
            "http://store.example.com/title/cool game",
            "http://store.example.com//title/game",
            "http://example.com/ok",
            "example.com:443",
        ];
        for input in inputs {
            let once = pipeline.apply(input);
            assert_eq!(pipeline.apply(&once), once, "not idempotent for {input:?}");
        }
    }
}
