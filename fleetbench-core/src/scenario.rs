use std::collections::BTreeMap;

use fleetbench_value::Value;

use crate::stages::StageName;

/// Master-local stage that evaluates results instead of being dispatched.
pub const ANALYZE_TEST: &str = "analyze-test";

/// An ordered tree of stages and control constructs.
///
/// Property values are kept raw; strings may hold `${...}` / `#{...}` expressions that are
/// resolved against the variable environment right before each use.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Scenario {
    pub nodes: Vec<ScenarioNode>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ScenarioNode {
    Stage(StageNode),
    Repeat(RepeatNode),
    Scale(ScaleNode),
    /// Binds a variable for the rest of the scenario.
    Define { name: String, value: Value },
    AnalyzeTest { properties: BTreeMap<String, Value> },
}

#[derive(Debug, Clone, PartialEq)]
pub struct StageNode {
    pub stage: String,
    pub properties: BTreeMap<String, Value>,
    /// A failing advisory stage is logged and the run continues.
    pub advisory: bool,
    /// Per-stage ack timeout; overrides the master default.
    pub timeout: Option<Value>,
    /// Restricts the dispatch to these slave indices.
    pub slaves: Option<Value>,
}

impl StageNode {
    pub fn new(stage: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            properties: BTreeMap::new(),
            advisory: false,
            timeout: None,
            slaves: None,
        }
    }

    #[must_use]
    pub fn property(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.properties.insert(key.to_string(), value.into());
        self
    }

    #[must_use]
    pub fn advisory(mut self) -> Self {
        self.advisory = true;
        self
    }

    #[must_use]
    pub fn timeout(mut self, timeout: impl Into<Value>) -> Self {
        self.timeout = Some(timeout.into());
        self
    }

    #[must_use]
    pub fn slaves(mut self, slaves: impl Into<Value>) -> Self {
        self.slaves = Some(slaves.into());
        self
    }
}

impl From<StageNode> for ScenarioNode {
    fn from(node: StageNode) -> Self {
        Self::Stage(node)
    }
}

/// Runs `body` once per counter value. Either `times` (counter `0..times`) or an inclusive
/// `from..=to` range stepped by `inc`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RepeatNode {
    pub name: Option<String>,
    pub times: Option<Value>,
    pub from: Option<Value>,
    pub to: Option<Value>,
    pub inc: Option<Value>,
    pub body: Vec<ScenarioNode>,
}

impl RepeatNode {
    pub fn times(times: impl Into<Value>, body: Vec<ScenarioNode>) -> Self {
        Self {
            times: Some(times.into()),
            body,
            ..Self::default()
        }
    }

    pub fn range(
        from: impl Into<Value>,
        to: impl Into<Value>,
        inc: impl Into<Value>,
        body: Vec<ScenarioNode>,
    ) -> Self {
        Self {
            from: Some(from.into()),
            to: Some(to.into()),
            inc: Some(inc.into()),
            body,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

impl From<RepeatNode> for ScenarioNode {
    fn from(node: RepeatNode) -> Self {
        Self::Repeat(node)
    }
}

/// Runs `body` once per active cluster size in `from..=to` stepped by `inc`; only the first
/// `size` slaves receive dispatches inside the body.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScaleNode {
    pub from: Option<Value>,
    pub to: Option<Value>,
    pub inc: Option<Value>,
    pub body: Vec<ScenarioNode>,
}

impl From<ScaleNode> for ScenarioNode {
    fn from(node: ScaleNode) -> Self {
        Self::Scale(node)
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{position}: {message}")]
pub struct ScenarioError {
    pub position: String,
    pub message: String,
}

impl Scenario {
    pub fn new(nodes: Vec<ScenarioNode>) -> Self {
        Self { nodes }
    }

    /// Static checks that need no variables: stage names and repeat shapes.
    pub fn validate(&self) -> Result<(), Vec<ScenarioError>> {
        let mut errors = Vec::new();
        validate_block(&self.nodes, "", &mut errors);
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Number of stage nodes, counting each once regardless of loops.
    pub fn stage_count(&self) -> usize {
        fn count(nodes: &[ScenarioNode]) -> usize {
            nodes
                .iter()
                .map(|n| match n {
                    ScenarioNode::Stage(_) | ScenarioNode::AnalyzeTest { .. } => 1,
                    ScenarioNode::Repeat(r) => count(&r.body),
                    ScenarioNode::Scale(s) => count(&s.body),
                    ScenarioNode::Define { .. } => 0,
                })
                .sum()
        }
        count(&self.nodes)
    }
}

fn validate_block(nodes: &[ScenarioNode], prefix: &str, errors: &mut Vec<ScenarioError>) {
    for (idx, node) in nodes.iter().enumerate() {
        let position = format!("{prefix}{idx}");
        let mut err = |message: String| {
            errors.push(ScenarioError {
                position: position.clone(),
                message,
            })
        };

        match node {
            ScenarioNode::Stage(s) => {
                if s.stage.parse::<StageName>().is_err() {
                    err(format!("unknown stage `{}`", s.stage));
                }
            }
            ScenarioNode::Repeat(r) => {
                match (&r.times, &r.to) {
                    (Some(_), Some(_)) => err("repeat takes either `times` or `to`, not both".into()),
                    (None, None) => err("repeat needs `times` or `to`".into()),
                    _ => {}
                }
                validate_block(&r.body, &format!("{position}."), errors);
            }
            ScenarioNode::Scale(s) => validate_block(&s.body, &format!("{position}."), errors),
            ScenarioNode::Define { name, .. } if name.trim().is_empty() => {
                err("define needs a variable name".into());
            }
            ScenarioNode::Define { .. } | ScenarioNode::AnalyzeTest { .. } => {}
        }
    }
}
