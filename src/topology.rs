//! Step selection, one policy per topology
//!
//! A policy looks at a workflow record and says what the supervisor should
//! do next. Policies never touch state or agents; the supervisor owns all
//! dispatch and retry machinery and only asks a policy to pick steps.

use chrono::Utc;
use serde_json::{json, Value};
use tracing::debug;

use crate::error::WeftError;
use crate::model::{StepDefinition, WorkflowState};
use crate::predicate::{Predicate, Truth};
use crate::protocol::TopologyKind;

/// What a supervisor should do next.
#[derive(Debug, Clone, PartialEq)]
pub enum NextAction {
    /// Run this step.
    Execute(String),
    /// Run `step`, chosen by a routing decision to be recorded.
    Route { step: String, decision: Value },
    /// Post these steps as claimable work and let agents race for them.
    Publish(Vec<String>),
    Complete,
    Fail(String),
}

pub trait StepPolicy: Send + Sync {
    fn kind(&self) -> TopologyKind;

    fn advance(&self, workflow: &WorkflowState) -> Result<NextAction, WeftError>;
}

pub fn policy_for(kind: TopologyKind) -> &'static dyn StepPolicy {
    match kind {
        TopologyKind::Linear => &Linear,
        TopologyKind::Conditional => &Conditional,
        TopologyKind::Hierarchical => &Hierarchical,
        TopologyKind::Swarm => &Swarm,
    }
}

/// One step after another: the explicit `next`, else declaration order.
pub struct Linear;

/// Linear sequencing where steps may delegate to child workflows.
pub struct Hierarchical;

/// Successor picked by evaluating route predicates over the last output.
pub struct Conditional;

/// Every step posted at once, claimed by whichever agent gets there first.
pub struct Swarm;

fn sequential(workflow: &WorkflowState) -> NextAction {
    let definition = &workflow.definition;
    let next = match &workflow.last_step {
        None => definition.entry(),
        Some(last) => match definition.get_step(last) {
            Some(step) => match &step.next {
                Some(next) => definition.get_step(next),
                None => definition.following(last),
            },
            None => return NextAction::Fail(format!("unknown step '{last}'")),
        },
    };
    match next {
        Some(step) => NextAction::Execute(step.id.clone()),
        None => NextAction::Complete,
    }
}

impl StepPolicy for Linear {
    fn kind(&self) -> TopologyKind {
        TopologyKind::Linear
    }

    fn advance(&self, workflow: &WorkflowState) -> Result<NextAction, WeftError> {
        Ok(sequential(workflow))
    }
}

impl StepPolicy for Hierarchical {
    fn kind(&self) -> TopologyKind {
        TopologyKind::Hierarchical
    }

    fn advance(&self, workflow: &WorkflowState) -> Result<NextAction, WeftError> {
        Ok(sequential(workflow))
    }
}

impl Conditional {
    fn route(&self, workflow: &WorkflowState, step: &StepDefinition) -> Result<NextAction, WeftError> {
        if step.routes.is_empty() {
            return Ok(match &step.next {
                Some(next) => NextAction::Execute(next.clone()),
                None => NextAction::Complete,
            });
        }

        let scope = json!({
            "output": workflow.last_output.clone().unwrap_or(Value::Null),
            "input": workflow.input,
        });

        let mut undecided = Vec::new();
        for route in &step.routes {
            let predicate = Predicate::parse(&route.when)?;
            match predicate.evaluate(&scope) {
                Truth::True => {
                    debug!(from = %step.id, to = %route.to, rule = %route.when, "route matched");
                    return Ok(decision(step, &route.to, &route.when));
                }
                Truth::False => {}
                Truth::Unknown => undecided.push(route.when.as_str()),
            }
        }

        // every predicate was decidable and false
        if undecided.is_empty() {
            if let Some(to) = &step.otherwise {
                return Ok(decision(step, to, "otherwise"));
            }
        }
        if let Some(to) = &step.fallback {
            return Ok(decision(step, to, "fallback"));
        }

        Ok(NextAction::Fail(if undecided.is_empty() {
            format!("no route out of step '{}' matched", step.id)
        } else {
            format!(
                "no route out of step '{}' matched; undecidable: {}",
                step.id,
                undecided.join(", ")
            )
        }))
    }
}

fn decision(step: &StepDefinition, to: &str, rule: &str) -> NextAction {
    NextAction::Route {
        step: to.to_string(),
        decision: json!({
            "from": step.id,
            "to": to,
            "rule": rule,
            "at": Utc::now(),
        }),
    }
}

impl StepPolicy for Conditional {
    fn kind(&self) -> TopologyKind {
        TopologyKind::Conditional
    }

    fn advance(&self, workflow: &WorkflowState) -> Result<NextAction, WeftError> {
        let definition = &workflow.definition;
        let Some(last) = &workflow.last_step else {
            return Ok(match definition.entry() {
                Some(step) => NextAction::Execute(step.id.clone()),
                None => NextAction::Complete,
            });
        };
        match definition.get_step(last) {
            Some(step) => self.route(workflow, step),
            None => Ok(NextAction::Fail(format!("unknown step '{last}'"))),
        }
    }
}

impl StepPolicy for Swarm {
    fn kind(&self) -> TopologyKind {
        TopologyKind::Swarm
    }

    fn advance(&self, workflow: &WorkflowState) -> Result<NextAction, WeftError> {
        let open: Vec<String> = workflow
            .definition
            .steps
            .iter()
            .filter(|s| !workflow.completed_steps.contains(&s.id))
            .map(|s| s.id.clone())
            .collect();
        if open.is_empty() {
            Ok(NextAction::Complete)
        } else {
            Ok(NextAction::Publish(open))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::WorkflowDefinition;

    fn workflow(definition: WorkflowDefinition) -> WorkflowState {
        definition.validate().unwrap();
        WorkflowState::new(definition, json!({"topic": "rust"}))
    }

    fn routed_to(action: NextAction) -> (String, Value) {
        match action {
            NextAction::Route { step, decision } => (step, decision),
            other => panic!("expected a route, got {other:?}"),
        }
    }

    fn scoring() -> WorkflowState {
        workflow(
            WorkflowDefinition::new("review", TopologyKind::Conditional)
                .step(
                    StepDefinition::task("score", "grader")
                        .route("output.score > 0.5", "publish")
                        .otherwise("rewrite"),
                )
                .step(StepDefinition::task("publish", "publisher"))
                .step(StepDefinition::task("rewrite", "writer")),
        )
    }

    #[test]
    fn test_policy_for() {
        for kind in [
            TopologyKind::Linear,
            TopologyKind::Conditional,
            TopologyKind::Hierarchical,
            TopologyKind::Swarm,
        ] {
            assert_eq!(policy_for(kind).kind(), kind);
        }
    }

    #[test]
    fn test_linear_walks_declaration_order() {
        let mut wf = workflow(
            WorkflowDefinition::new("pipeline", TopologyKind::Linear)
                .step(StepDefinition::task("fetch", "http"))
                .step(StepDefinition::task("parse", "html")),
        );
        let policy = policy_for(TopologyKind::Linear);

        assert_eq!(policy.advance(&wf).unwrap(), NextAction::Execute("fetch".into()));
        wf.complete_step("fetch", json!("<html>"));
        assert_eq!(policy.advance(&wf).unwrap(), NextAction::Execute("parse".into()));
        wf.complete_step("parse", json!({}));
        assert_eq!(policy.advance(&wf).unwrap(), NextAction::Complete);
    }

    #[test]
    fn test_linear_follows_explicit_next() {
        let mut wf = workflow(
            WorkflowDefinition::new("skip", TopologyKind::Linear)
                .step(StepDefinition::task("a", "x").then("c"))
                .step(StepDefinition::task("b", "x"))
                .step(StepDefinition::task("c", "x")),
        );
        wf.complete_step("a", Value::Null);
        assert_eq!(
            policy_for(TopologyKind::Linear).advance(&wf).unwrap(),
            NextAction::Execute("c".into())
        );
    }

    #[test]
    fn test_conditional_high_score_routes_to_match() {
        let mut wf = scoring();
        let policy = policy_for(TopologyKind::Conditional);
        assert_eq!(policy.advance(&wf).unwrap(), NextAction::Execute("score".into()));

        wf.complete_step("score", json!({"score": 0.7}));
        let (step, decision) = routed_to(policy.advance(&wf).unwrap());
        assert_eq!(step, "publish");
        assert_eq!(decision["rule"], "output.score > 0.5");
        assert_eq!(decision["from"], "score");
    }

    #[test]
    fn test_conditional_low_score_routes_otherwise() {
        let mut wf = scoring();
        wf.complete_step("score", json!({"score": 0.3}));
        let (step, decision) = routed_to(policy_for(TopologyKind::Conditional).advance(&wf).unwrap());
        assert_eq!(step, "rewrite");
        assert_eq!(decision["rule"], "otherwise");
    }

    #[test]
    fn test_conditional_missing_field_without_fallback_fails() {
        let mut wf = scoring();
        wf.complete_step("score", json!({"grade": "B"}));
        match policy_for(TopologyKind::Conditional).advance(&wf).unwrap() {
            NextAction::Fail(reason) => assert!(reason.contains("undecidable")),
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[test]
    fn test_conditional_missing_field_takes_fallback() {
        let mut wf = workflow(
            WorkflowDefinition::new("review", TopologyKind::Conditional)
                .step(
                    StepDefinition::task("score", "grader")
                        .route("output.score > 0.5", "publish")
                        .otherwise("rewrite")
                        .fallback("triage"),
                )
                .step(StepDefinition::task("publish", "publisher"))
                .step(StepDefinition::task("rewrite", "writer"))
                .step(StepDefinition::task("triage", "human")),
        );
        wf.complete_step("score", json!({}));
        let (step, _) = routed_to(policy_for(TopologyKind::Conditional).advance(&wf).unwrap());
        assert_eq!(step, "triage");
    }

    #[test]
    fn test_conditional_step_without_routes_ends_or_follows_next() {
        let mut wf = scoring();
        let policy = policy_for(TopologyKind::Conditional);
        wf.complete_step("publish", json!("ok"));
        // no implicit successor by declaration order
        assert_eq!(policy.advance(&wf).unwrap(), NextAction::Complete);
    }

    #[test]
    fn test_swarm_publishes_open_steps() {
        let mut wf = workflow(
            WorkflowDefinition::new("crawl", TopologyKind::Swarm)
                .step(StepDefinition::task("a", "crawl"))
                .step(StepDefinition::task("b", "crawl")),
        );
        let policy = policy_for(TopologyKind::Swarm);
        assert_eq!(
            policy.advance(&wf).unwrap(),
            NextAction::Publish(vec!["a".into(), "b".into()])
        );
        wf.complete_step("a", json!(1));
        assert_eq!(policy.advance(&wf).unwrap(), NextAction::Publish(vec!["b".into()]));
        wf.complete_step("b", json!(2));
        assert_eq!(policy.advance(&wf).unwrap(), NextAction::Complete);
    }
}
