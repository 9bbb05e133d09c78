//! Pending-request arbitration.
//!
//! Every proposed tool invocation is checked against two ordered
//! policies before a human gets involved: an auto-allow set of tool
//! names, then an ordered auto-deny rule list (first match wins). Only
//! calls that neither policy resolves become `PendingRequest`s.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;

/// Human decision on a permission request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "decision")]
pub enum PermissionDecision {
    /// Allow this one invocation.
    Allow,
    /// Allow and add the tool to the auto-allow set.
    AllowAll,
    /// Deny with a reason surfaced to the agent.
    Deny { reason: String },
}

/// Resolution delivered to a suspended request.
#[derive(Debug, Clone)]
pub enum Resolution {
    Permission(PermissionDecision),
    Answer(String),
    /// The owning session stopped before a human answered.
    Aborted,
}

/// One auto-deny rule, matched in order against the tool-specific field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoDenyRule {
    pub tool: String,
    /// Substring matched against the command (shell tools) or path.
    pub pattern: String,
    pub reason: String,
}

/// Auto-policy configuration.
#[derive(Debug, Clone)]
pub struct PolicyConfig {
    pub auto_allow: HashSet<String>,
    pub auto_deny: Vec<AutoDenyRule>,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        let auto_allow = ["Read", "Glob", "Grep", "WebSearch", "WebFetch", "TodoWrite", "Task"]
            .into_iter()
            .map(String::from)
            .collect();
        Self {
            auto_allow,
            auto_deny: Vec::new(),
        }
    }
}

/// Outcome of policy evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Allow,
    Deny(String),
    /// Neither policy fired; a human must decide.
    Escalate,
}

/// Kind of a pending request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingKind {
    Permission,
    Question,
}

struct Pending {
    kind: PendingKind,
    desk_id: String,
    tool_name: String,
    resolver: oneshot::Sender<Resolution>,
}

/// Permission/question correlation table plus auto-policy.
pub struct Arbitrator {
    policy: Mutex<PolicyConfig>,
    pending: Mutex<HashMap<String, Pending>>,
}

impl Default for Arbitrator {
    fn default() -> Self {
        Self::new(PolicyConfig::default())
    }
}

impl Arbitrator {
    #[must_use]
    pub fn new(policy: PolicyConfig) -> Self {
        Self {
            policy: Mutex::new(policy),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Evaluate a proposed tool invocation against the auto-policies.
    #[must_use]
    pub fn evaluate(&self, tool_name: &str, input: &Value) -> Verdict {
        let policy = self.policy.lock().unwrap();

        if policy.auto_allow.contains(tool_name) {
            return Verdict::Allow;
        }

        let subject = match_field(tool_name, input);
        for rule in &policy.auto_deny {
            if rule.tool == tool_name && subject.contains(&rule.pattern) {
                return Verdict::Deny(rule.reason.clone());
            }
        }

        Verdict::Escalate
    }

    /// Add a tool to the auto-allow set (the `allowAll` decision).
    pub fn allow_tool(&self, tool_name: &str) {
        self.policy
            .lock()
            .unwrap()
            .auto_allow
            .insert(tool_name.to_string());
    }

    /// Suspend a request pending a human decision.
    ///
    /// Exactly one slot exists per `tool_use_id`; a duplicate escalation
    /// replaces the previous slot, whose waiter observes a closed channel.
    #[must_use]
    pub fn escalate(
        &self,
        kind: PendingKind,
        desk_id: &str,
        tool_use_id: &str,
        tool_name: &str,
    ) -> oneshot::Receiver<Resolution> {
        let (resolver, rx) = oneshot::channel();
        let previous = self.pending.lock().unwrap().insert(
            tool_use_id.to_string(),
            Pending {
                kind,
                desk_id: desk_id.to_string(),
                tool_name: tool_name.to_string(),
                resolver,
            },
        );
        if previous.is_some() {
            tracing::warn!("Replaced pending request for toolUseId {tool_use_id}");
        }
        rx
    }

    /// Resolve a pending permission request.
    ///
    /// The entry is removed before the resolver fires, so a second call
    /// with the same id is a no-op. Returns whether a pending was found.
    pub fn respond(&self, tool_use_id: &str, decision: PermissionDecision) -> bool {
        let Some(pending) = self.pending.lock().unwrap().remove(tool_use_id) else {
            tracing::debug!("Dropping response for unknown toolUseId {tool_use_id}");
            return false;
        };

        if decision == PermissionDecision::AllowAll {
            self.allow_tool(&pending.tool_name);
        }
        let _ = pending.resolver.send(Resolution::Permission(decision));
        true
    }

    /// Resolve a pending question.
    ///
    /// If the id is unknown but exactly one question is pending, the
    /// answer is applied to it; ids drift between layers. An unknown id
    /// with zero or several pending questions is dropped.
    pub fn answer(&self, tool_use_id: &str, text: String) -> bool {
        let mut pending = self.pending.lock().unwrap();

        let key = if pending
            .get(tool_use_id)
            .is_some_and(|p| p.kind == PendingKind::Question)
        {
            Some(tool_use_id.to_string())
        } else {
            let mut questions = pending
                .iter()
                .filter(|(_, p)| p.kind == PendingKind::Question)
                .map(|(id, _)| id.clone());
            match (questions.next(), questions.next()) {
                (Some(only), None) => {
                    tracing::warn!(
                        "Answer for unknown toolUseId {tool_use_id} applied to sole pending question {only}"
                    );
                    Some(only)
                }
                _ => None,
            }
        };

        let Some(key) = key else {
            tracing::debug!("Dropping answer for unknown toolUseId {tool_use_id}");
            return false;
        };
        if let Some(entry) = pending.remove(&key) {
            let _ = entry.resolver.send(Resolution::Answer(text));
            return true;
        }
        false
    }

    /// Resolve every outstanding pending request as aborted.
    ///
    /// With a desk id, only that desk's requests are resolved; used when
    /// a session is stopped or superseded.
    pub fn stop_all(&self, desk_id: Option<&str>) {
        let mut pending = self.pending.lock().unwrap();
        let keys: Vec<String> = pending
            .iter()
            .filter(|(_, p)| desk_id.is_none_or(|d| p.desk_id == d))
            .map(|(id, _)| id.clone())
            .collect();
        for key in keys {
            if let Some(entry) = pending.remove(&key) {
                let _ = entry.resolver.send(Resolution::Aborted);
            }
        }
    }

    /// Whether a desk has any pending request open.
    #[must_use]
    pub fn has_pending(&self, desk_id: &str) -> bool {
        self.pending
            .lock()
            .unwrap()
            .values()
            .any(|p| p.desk_id == desk_id)
    }
}

/// The field a deny rule matches: command text for shell-like tools,
/// the file path otherwise.
fn match_field(tool_name: &str, input: &Value) -> String {
    let is_shell = tool_name.eq_ignore_ascii_case("bash")
        || tool_name.to_ascii_lowercase().contains("shell");
    let field = if is_shell { "command" } else { "file_path" };
    input
        .get(field)
        .or_else(|| input.get("path"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deny_rm() -> AutoDenyRule {
        AutoDenyRule {
            tool: "Bash".into(),
            pattern: "rm -rf".into(),
            reason: "destructive".into(),
        }
    }

    #[test]
    fn auto_allow_wins_before_deny_rules() {
        let mut policy = PolicyConfig::default();
        policy.auto_deny.push(AutoDenyRule {
            tool: "Read".into(),
            pattern: "/etc".into(),
            reason: "nope".into(),
        });
        let arb = Arbitrator::new(policy);
        assert_eq!(
            arb.evaluate("Read", &serde_json::json!({"file_path": "/etc/passwd"})),
            Verdict::Allow
        );
    }

    #[test]
    fn first_matching_deny_rule_wins() {
        let mut policy = PolicyConfig::default();
        policy.auto_deny.push(deny_rm());
        policy.auto_deny.push(AutoDenyRule {
            tool: "Bash".into(),
            pattern: "rm".into(),
            reason: "second".into(),
        });
        let arb = Arbitrator::new(policy);
        assert_eq!(
            arb.evaluate("Bash", &serde_json::json!({"command": "rm -rf /"})),
            Verdict::Deny("destructive".into())
        );
    }

    #[test]
    fn unmatched_call_escalates() {
        let arb = Arbitrator::new(PolicyConfig::default());
        assert_eq!(
            arb.evaluate("Edit", &serde_json::json!({"file_path": "/tmp/a"})),
            Verdict::Escalate
        );
    }

    #[tokio::test]
    async fn respond_is_at_most_once() {
        let arb = Arbitrator::default();
        let rx = arb.escalate(PendingKind::Permission, "desk-1", "tu_1", "Edit");

        assert!(arb.respond("tu_1", PermissionDecision::Allow));
        // Second respond on the same id is a no-op.
        assert!(!arb.respond("tu_1", PermissionDecision::Deny { reason: "late".into() }));

        match rx.await.unwrap() {
            Resolution::Permission(PermissionDecision::Allow) => {}
            other => panic!("unexpected resolution: {other:?}"),
        }
    }

    #[tokio::test]
    async fn allow_all_extends_the_auto_allow_set() {
        let arb = Arbitrator::default();
        let _rx = arb.escalate(PendingKind::Permission, "desk-1", "tu_1", "Edit");
        assert!(arb.respond("tu_1", PermissionDecision::AllowAll));
        assert_eq!(arb.evaluate("Edit", &serde_json::json!({})), Verdict::Allow);
    }

    #[tokio::test]
    async fn answer_falls_back_to_sole_pending_question() {
        let arb = Arbitrator::default();
        let rx = arb.escalate(PendingKind::Question, "desk-1", "tu_q", "AskUserQuestion");
        // Permission pendings must not absorb the fallback.
        let _p = arb.escalate(PendingKind::Permission, "desk-1", "tu_p", "Edit");

        assert!(arb.answer("wrong-id", "yes".into()));
        match rx.await.unwrap() {
            Resolution::Answer(text) => assert_eq!(text, "yes"),
            other => panic!("unexpected resolution: {other:?}"),
        }
    }

    #[tokio::test]
    async fn ambiguous_answer_is_dropped() {
        let arb = Arbitrator::default();
        let _a = arb.escalate(PendingKind::Question, "desk-1", "q1", "AskUserQuestion");
        let _b = arb.escalate(PendingKind::Question, "desk-1", "q2", "AskUserQuestion");
        assert!(!arb.answer("wrong-id", "yes".into()));
        assert!(arb.has_pending("desk-1"));
    }

    #[tokio::test]
    async fn stop_all_aborts_only_the_named_desk() {
        let arb = Arbitrator::default();
        let rx1 = arb.escalate(PendingKind::Permission, "desk-1", "a", "Edit");
        let rx2 = arb.escalate(PendingKind::Question, "desk-2", "b", "AskUserQuestion");

        arb.stop_all(Some("desk-1"));
        assert!(matches!(rx1.await.unwrap(), Resolution::Aborted));
        assert!(!arb.has_pending("desk-1"));
        assert!(arb.has_pending("desk-2"));

        arb.stop_all(None);
        assert!(matches!(rx2.await.unwrap(), Resolution::Aborted));
    }
}
