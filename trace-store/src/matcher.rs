use crate::model::ParamSet;
use crate::model::Params;

/// Boolean predicate over a trace's parameters. Ignore rules and the public
/// visibility policy are both expressed through this trait.
pub trait ParamsMatcher: Send + Sync {
    fn matches(&self, params: &Params) -> bool;
}

/// Matches when any of its rules matches. An empty rule set matches nothing.
#[derive(Debug, Clone, Default)]
pub struct RuleSetMatcher {
    rules: Vec<ParamSet>,
}

impl RuleSetMatcher {
    pub fn new(rules: Vec<ParamSet>) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &[ParamSet] {
        &self.rules
    }
}

impl ParamsMatcher for RuleSetMatcher {
    fn matches(&self, params: &Params) -> bool {
        self.rules.iter().any(|rule| rule.matches(params))
    }
}

impl<F> ParamsMatcher for F
where
    F: Fn(&Params) -> bool + Send + Sync,
{
    fn matches(&self, params: &Params) -> bool {
        self(params)
    }
}
