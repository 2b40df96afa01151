//! Command execution.

use crate::config::SimulateConfig;
use colored::Colorize;
use motif_core::{CurrentStep, Next, StepDefinition, TransitionStatus, Workflow};
use motif_persist::{import_basic, BasicExport, PersistError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cell::RefCell;
use std::collections::BTreeSet;
use std::path::Path;
use std::rc::Rc;

/// API of a relay step: it forwards whatever output it is given.
#[derive(Clone)]
pub struct Relay {
    pub input: Value,
    pub next: Next<Relay>,
}

fn relay(kind: &str) -> StepDefinition<Relay> {
    StepDefinition::new(kind, |ctx| {
        let id = ctx.id().to_string();
        ctx.transition_in(move || tracing::debug!("Relay '{}' entered", id));
        Relay {
            input: ctx.input().clone(),
            next: ctx.next(),
        }
    })
}

/// Builds a relay workflow over every kind the document names and imports it.
pub fn relay_workflow(doc: &BasicExport) -> Result<Workflow<Relay>, PersistError> {
    let kinds: BTreeSet<&str> = doc.graph.nodes.iter().map(|n| n.kind.as_str()).collect();
    let workflow = Workflow::new(kinds.into_iter().map(relay))?;
    import_basic(&workflow, doc)?;
    Ok(workflow)
}

/// Loads a basic export and describes its graph.
pub fn check(path: &Path) -> Result<String, Box<dyn std::error::Error>> {
    let doc: BasicExport = motif_persist::load(path)?;
    let workflow = relay_workflow(&doc)?;
    let internals = workflow.internals();
    let nodes = internals.nodes();
    let edges = internals.edges();

    let mut output = format!(
        "{} {} ({} nodes, {} edges)\n",
        "Valid".green(),
        path.display().to_string().cyan(),
        nodes.len(),
        edges.len()
    );

    output.push_str(&format!("{}\n", "Nodes".bold()));
    for node in &nodes {
        output.push_str(&format!("  {} [{}]\n", node.id().cyan(), node.kind()));
    }

    output.push_str(&format!("{}\n", "Edges".bold()));
    for edge in &edges {
        let mut line = format!(
            "  {} -> {} ({})",
            edge.from().id().cyan(),
            edge.to().id().cyan(),
            edge.kind()
        );
        if let Some(expr) = edge.serialized_config() {
            line.push_str(&format!(" {}", expr.dimmed()));
        }
        if edge.is_unidirectional() {
            line.push_str(&format!(" {}", "unidirectional".yellow()));
        }
        output.push_str(&line);
        output.push('\n');
    }

    let dead_ends: Vec<&str> = nodes
        .iter()
        .filter(|n| !edges.iter().any(|e| e.from().same(n)))
        .map(|n| n.id())
        .collect();
    if dead_ends.is_empty() {
        output.push_str(&format!("{}", "No dead ends".dimmed()));
    } else {
        output.push_str(&format!("{}: {}", "Dead ends".yellow(), dead_ends.join(", ")));
    }

    Ok(output)
}

/// A scripted action: `{next: <value>}`, `back`, `pause`, `resume` or `stop`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawAction", into = "RawAction")]
pub enum Action {
    /// Sends an output from the active step.
    Next(Value),
    Back,
    Pause,
    Resume,
    Stop,
}

impl Action {
    fn name(&self) -> &'static str {
        match self {
            Action::Next(_) => "next",
            Action::Back => "back",
            Action::Pause => "pause",
            Action::Resume => "resume",
            Action::Stop => "stop",
        }
    }
}

/// Document shape of an action. Plain strings and one-key maps read the same
/// way in JSON and YAML.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum RawAction {
    Word(String),
    Next { next: Value },
}

impl TryFrom<RawAction> for Action {
    type Error = String;

    fn try_from(raw: RawAction) -> Result<Self, Self::Error> {
        match raw {
            RawAction::Next { next } => Ok(Action::Next(next)),
            RawAction::Word(word) => match word.as_str() {
                "back" => Ok(Action::Back),
                "pause" => Ok(Action::Pause),
                "resume" => Ok(Action::Resume),
                "stop" => Ok(Action::Stop),
                "next" => Err("'next' needs an output: use {next: <value>}".to_string()),
                other => Err(format!("unknown action '{}'", other)),
            },
        }
    }
}

impl From<Action> for RawAction {
    fn from(action: Action) -> Self {
        match action {
            Action::Next(next) => RawAction::Next { next },
            other => RawAction::Word(other.name().to_string()),
        }
    }
}

/// A workflow plus the actions to drive it with.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scenario {
    pub workflow: BasicExport,
    /// Id of the node to start at.
    pub start: String,
    #[serde(default)]
    pub input: Value,
    #[serde(default)]
    pub actions: Vec<Action>,
}

/// Runs a scenario and returns the transcript.
pub fn simulate(path: &Path, config: &SimulateConfig) -> Result<String, Box<dyn std::error::Error>> {
    let scenario: Scenario = motif_persist::load(path)?;
    run_scenario(&scenario, config)
}

pub fn run_scenario(
    scenario: &Scenario,
    config: &SimulateConfig,
) -> Result<String, Box<dyn std::error::Error>> {
    if scenario.actions.len() > config.max_actions {
        return Err(format!(
            "scenario has {} actions, the limit is {}",
            scenario.actions.len(),
            config.max_actions
        )
        .into());
    }

    let workflow = relay_workflow(&scenario.workflow)?;
    let start = workflow
        .internals()
        .node(&scenario.start)
        .ok_or_else(|| PersistError::UnknownNode(scenario.start.clone()))?;

    let transcript = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&transcript);
    let print_state = config.print_state;
    let subscription = workflow.subscribe(move |step| {
        sink.borrow_mut().push(describe(step, print_state));
    });

    report(&transcript, "start", workflow.start(&start, scenario.input.clone()));
    for action in &scenario.actions {
        let label = action.name();
        transcript
            .borrow_mut()
            .push(format!("{} {}", ">".dimmed(), label.bold()));

        let result = match action {
            Action::Next(output) => match workflow.current_step() {
                Some(step) => step.state.next.send(output.clone()),
                None => {
                    transcript
                        .borrow_mut()
                        .push(format!("  {}", "no active step".yellow()));
                    Ok(())
                }
            },
            Action::Back => workflow.go_back(),
            Action::Pause => {
                workflow.pause();
                Ok(())
            }
            Action::Resume => {
                workflow.resume();
                Ok(())
            }
            Action::Stop => {
                workflow.stop();
                Ok(())
            }
        };
        report(&transcript, label, result);
    }

    subscription.unsubscribe();
    let lines = transcript.borrow().join("\n");
    Ok(lines)
}

fn report(
    transcript: &RefCell<Vec<String>>,
    label: &str,
    result: Result<(), motif_core::WorkflowError>,
) {
    if let Err(e) = result {
        tracing::debug!("Action '{}' failed: {}", label, e);
        transcript
            .borrow_mut()
            .push(format!("  {} [{}]: {}", "Error".red(), e.error_code(), e));
    }
}

fn describe(step: Option<&CurrentStep<Relay>>, print_state: bool) -> String {
    let Some(step) = step else {
        return format!("  {}", "stopped".yellow());
    };
    let status = match step.status {
        TransitionStatus::TransitionIn => step.status.label().cyan(),
        TransitionStatus::Ready => step.status.label().green(),
        TransitionStatus::TransitionOut => step.status.label().dimmed(),
    };
    let mut line = format!("  {} {}", status, step.id);
    if step.status == TransitionStatus::Ready {
        if step.can_go_back {
            line.push_str(&format!(" {}", "(can go back)".dimmed()));
        }
        if print_state {
            line.push_str(&format!(" input={}", step.state.input));
        }
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const GRAPH: &str = r#"
format: motif/basic
schemaVersion: 1
nodes:
  - id: Number
    kind: Number
  - id: Parity:even
    kind: Parity
    name: even
  - id: Parity:odd
    kind: Parity
    name: odd
edges:
  - kind: conditional
    from: Number
    to: Parity:even
    config: "out % 2 === 0"
  - kind: conditional
    from: Number
    to: Parity:odd
    config: "out % 2 !== 0"
    unidirectional: true
"#;

    fn plain() {
        colored::control::set_override(false);
    }

    fn graph() -> String {
        GRAPH.to_string()
    }

    #[test]
    fn test_check() {
        plain();
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("graph.yaml");
        std::fs::write(&path, graph()).unwrap();

        let output = check(&path).unwrap();

        assert!(output.contains("(3 nodes, 2 edges)"));
        assert!(output.contains("  Parity:even [Parity]"));
        assert!(output.contains("  Number -> Parity:odd (conditional) out % 2 !== 0 unidirectional"));
        assert!(output.ends_with("Dead ends: Parity:even, Parity:odd"));
    }

    #[test]
    fn test_check_unknown_node() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("graph.yaml");
        std::fs::write(&path, graph().replace("to: Parity:odd", "to: Nowhere")).unwrap();

        let err = check(&path).unwrap_err();
        assert!(err.to_string().contains("Nowhere"));
    }

    fn scenario(actions: &str) -> Scenario {
        let graph: String = graph()
            .lines()
            .map(|l| format!("  {}\n", l))
            .collect();
        let actions = if actions.is_empty() {
            " []\n".to_string()
        } else {
            format!("\n{}", actions)
        };
        let text = format!("workflow:\n{}start: Number\ninput: 0\nactions:{}", graph, actions);
        serde_yaml::from_str(&text).unwrap()
    }

    #[test]
    fn test_scenario_actions_parse() {
        let s = scenario("  - next: 4\n  - back\n  - pause\n  - resume\n  - stop\n");
        assert_eq!(
            s.actions,
            vec![
                Action::Next(serde_json::json!(4)),
                Action::Back,
                Action::Pause,
                Action::Resume,
                Action::Stop,
            ]
        );
    }

    #[test]
    fn test_actions_from_json() {
        let actions: Vec<Action> =
            serde_json::from_str(r#"[{"next": {"ok": true}}, "back", "stop"]"#).unwrap();
        assert_eq!(
            actions,
            vec![
                Action::Next(serde_json::json!({"ok": true})),
                Action::Back,
                Action::Stop,
            ]
        );
        assert_eq!(
            serde_json::to_string(&actions).unwrap(),
            r#"[{"next":{"ok":true}},"back","stop"]"#
        );
    }

    #[test]
    fn test_unknown_action_rejected() {
        let err = serde_yaml::from_str::<Vec<Action>>("- jump\n").unwrap_err();
        assert!(err.to_string().contains("unknown action 'jump'"));
        assert!(serde_yaml::from_str::<Vec<Action>>("- next\n").is_err());
    }

    #[test]
    fn test_simulate_parity_demo() {
        plain();
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("demos/parity.yaml");

        let output = simulate(&path, &SimulateConfig::default()).unwrap();
        let lines: Vec<&str> = output.lines().collect();

        assert!(output.contains("  Ready Parity:even (can go back) input=4"));
        assert!(output.contains("Error [NAVIGATION]"));
        assert!(output.contains(r#"  Ready Summary (can go back) input={"label":"odd","value":7}"#));
        assert!(!output.contains("Error [ROUTING]"));
        assert_eq!(*lines.last().unwrap(), "  stopped");
    }

    #[test]
    fn test_simulate_transcript() {
        plain();
        let s = scenario("  - next: 4\n  - back\n  - next: 3\n  - back\n  - stop\n");

        let output = run_scenario(&s, &SimulateConfig::default()).unwrap();
        let lines: Vec<&str> = output.lines().collect();

        assert_eq!(lines[0], "  Transition In Number");
        assert_eq!(lines[1], "  Ready Number input=0");
        assert!(output.contains("  Ready Parity:even (can go back) input=4"));
        assert!(output.contains("  Ready Parity:odd input=3"));
        assert!(output.contains("Error [NAVIGATION]"));
        assert_eq!(*lines.last().unwrap(), "  stopped");
    }

    #[test]
    fn test_simulate_routing_error_continues() {
        plain();
        let s = scenario("  - next: 2\n  - next: 1\n  - next: 5\n");

        let output = run_scenario(&s, &SimulateConfig::default()).unwrap();

        assert!(output.contains("Error [ROUTING]"));
        assert!(output.contains("no active step"));
    }

    #[test]
    fn test_simulate_action_limit() {
        let s = scenario("  - pause\n  - resume\n");
        let config = SimulateConfig {
            max_actions: 1,
            print_state: false,
        };
        let err = run_scenario(&s, &config).unwrap_err();
        assert!(err.to_string().contains("limit is 1"));
    }

    #[test]
    fn test_simulate_without_state() {
        plain();
        let s = scenario("");
        let config = SimulateConfig {
            max_actions: 10,
            print_state: false,
        };
        let output = run_scenario(&s, &config).unwrap();
        assert_eq!(output, "  Transition In Number\n  Ready Number");
    }
}
