//! Builtin role state tables.
//!
//! Only the closed state sets, transition tables, and resume policies
//! live here; decision logic (what to ask a model, how to parse a plan)
//! belongs to the [`crate::machine::RoleBehavior`] implementations
//! supplied by the embedding application.

use crate::machine::{ResumePolicy, RoleSpec, DONE, ERROR};

/// Coordinator that breaks a specification into stories and reviews
/// results.
pub const ARCHITECT: &str = "architect";
/// Ephemeral worker that implements and tests one story at a time.
pub const CODER: &str = "coder";
/// Watchdog that monitors progress and escalates stalls.
pub const PROJECT_MANAGER: &str = "project_manager";

/// Architect: PLANNING -> DISPATCHING -> REVIEWING, cycling between
/// dispatch and review until the backlog is empty. Restored in full on
/// resume; its checkpoint carries the durable plan.
pub fn architect() -> RoleSpec {
    RoleSpec::new(ARCHITECT, "PLANNING")
        .transition("PLANNING", ["DISPATCHING", DONE, ERROR])
        .transition("DISPATCHING", ["REVIEWING", DONE, ERROR])
        .transition("REVIEWING", ["DISPATCHING", DONE, ERROR])
        .resume_policy(ResumePolicy::FullRestore)
}

/// Coder: waits for a story, codes, tests, and seeks approval. Restarts
/// fresh on resume; the architect's checkpoint is the durable source of
/// what remains to be done.
pub fn coder() -> RoleSpec {
    RoleSpec::new(CODER, "WAITING")
        .transition("WAITING", ["CODING", DONE, ERROR])
        .transition("CODING", ["TESTING", ERROR])
        .transition("TESTING", ["CODING", "AWAIT_APPROVAL", ERROR])
        .transition("AWAIT_APPROVAL", ["WAITING", "CODING", DONE, ERROR])
        .require_key("story_id")
        .resume_policy(ResumePolicy::FreshStart)
}

/// Project manager: monitors the fleet and escalates. Restored in full
/// on resume.
pub fn project_manager() -> RoleSpec {
    RoleSpec::new(PROJECT_MANAGER, "MONITORING")
        .transition("MONITORING", ["ESCALATING", DONE, ERROR])
        .transition("ESCALATING", ["MONITORING", DONE, ERROR])
        .resume_policy(ResumePolicy::FullRestore)
}

/// All shipped role tables.
pub fn builtin_roles() -> Vec<RoleSpec> {
    vec![architect(), coder(), project_manager()]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::StateName;

    #[test]
    fn test_builtin_tables_reach_both_terminals() {
        for spec in builtin_roles() {
            let reaches_done = spec_reaches(&spec, &StateName::done());
            let reaches_error = spec_reaches(&spec, &StateName::error());
            assert!(reaches_done, "role '{}' cannot reach DONE", spec.role);
            assert!(reaches_error, "role '{}' cannot reach ERROR", spec.role);
        }
    }

    fn spec_reaches(spec: &RoleSpec, terminal: &StateName) -> bool {
        // Walk every declared source state; the table is small.
        let sources = [
            "PLANNING",
            "DISPATCHING",
            "REVIEWING",
            "WAITING",
            "CODING",
            "TESTING",
            "AWAIT_APPROVAL",
            "MONITORING",
            "ESCALATING",
        ];
        sources
            .iter()
            .any(|s| spec.allows(&StateName::new(*s), terminal))
    }

    #[test]
    fn test_coder_cannot_skip_testing() {
        let spec = coder();
        assert!(!spec.allows(&"CODING".into(), &"AWAIT_APPROVAL".into()));
        assert!(spec.allows(&"CODING".into(), &"TESTING".into()));
        assert!(spec.allows(&"TESTING".into(), &"AWAIT_APPROVAL".into()));
    }

    #[test]
    fn test_resume_policies_are_declared() {
        assert_eq!(architect().resume_policy, ResumePolicy::FullRestore);
        assert_eq!(coder().resume_policy, ResumePolicy::FreshStart);
        assert_eq!(project_manager().resume_policy, ResumePolicy::FullRestore);
    }
}
