/// Unit tests for the workflow lifecycle state machine in `workflow.rs`.
///
/// Each legal edge and the duplicate/out-of-order tolerance are covered in
/// isolation; the full pipeline is exercised by the integration tests.
#[cfg(test)]
mod tests {
    use std::sync::{Arc, RwLock};

    use chrono::Utc;

    use crate::domain::workflow::{try_transition, Workflow, WorkflowStatus, WorkflowType};
    use crate::error::Error;

    fn mock_workflow() -> Workflow {
        Workflow::new("matrix-sum", WorkflowType::MatrixAddition, "tester", Utc::now())
    }

    fn advance(workflow: &mut Workflow, statuses: &[WorkflowStatus]) {
        for status in statuses {
            workflow.transition(*status).expect("legal edge rejected");
        }
    }

    #[test]
    fn test_happy_path_to_completed() {
        let mut workflow = mock_workflow();
        advance(
            &mut workflow,
            &[
                WorkflowStatus::Validated,
                WorkflowStatus::Submitted,
                WorkflowStatus::Splitting,
                WorkflowStatus::Assigning,
                WorkflowStatus::Pending,
                WorkflowStatus::Running,
                WorkflowStatus::Aggregating,
                WorkflowStatus::Completed,
            ],
        );
        assert_eq!(workflow.status, WorkflowStatus::Completed);
        assert!(workflow.status.is_terminal());
    }

    #[test]
    fn test_running_straight_to_completed() {
        let mut workflow = mock_workflow();
        advance(
            &mut workflow,
            &[
                WorkflowStatus::Validated,
                WorkflowStatus::Submitted,
                WorkflowStatus::Splitting,
                WorkflowStatus::Assigning,
                WorkflowStatus::Pending,
                WorkflowStatus::Running,
                WorkflowStatus::Completed,
            ],
        );
        assert_eq!(workflow.status, WorkflowStatus::Completed);
    }

    #[test]
    fn test_partial_failure_loop_back_to_running() {
        let mut workflow = mock_workflow();
        advance(
            &mut workflow,
            &[
                WorkflowStatus::Validated,
                WorkflowStatus::Submitted,
                WorkflowStatus::Splitting,
                WorkflowStatus::Assigning,
                WorkflowStatus::Pending,
                WorkflowStatus::Running,
                WorkflowStatus::PartialFailure,
                WorkflowStatus::Reassigning,
                WorkflowStatus::Running,
            ],
        );
        assert_eq!(workflow.status, WorkflowStatus::Running);
    }

    #[test]
    fn test_skipping_stages_is_illegal() {
        let mut workflow = mock_workflow();
        let result = workflow.transition(WorkflowStatus::Running);
        assert!(matches!(result, Err(Error::IllegalTransition { from: WorkflowStatus::Created, to: WorkflowStatus::Running })));
        // The status never moved.
        assert_eq!(workflow.status, WorkflowStatus::Created);
    }

    #[test]
    fn test_no_backward_edges() {
        let mut workflow = mock_workflow();
        advance(&mut workflow, &[WorkflowStatus::Validated, WorkflowStatus::Submitted]);
        assert!(workflow.transition(WorkflowStatus::Created).is_err());
        assert!(workflow.transition(WorkflowStatus::Validated).is_err());
        assert_eq!(workflow.status, WorkflowStatus::Submitted);
    }

    #[test]
    fn test_every_non_terminal_state_can_fail() {
        let reachable = [
            vec![],
            vec![WorkflowStatus::Validated],
            vec![WorkflowStatus::Validated, WorkflowStatus::Submitted],
            vec![WorkflowStatus::Validated, WorkflowStatus::Submitted, WorkflowStatus::Splitting],
            vec![WorkflowStatus::Validated, WorkflowStatus::Submitted, WorkflowStatus::Splitting, WorkflowStatus::Assigning],
        ];
        for path in reachable {
            let mut workflow = mock_workflow();
            advance(&mut workflow, &path);
            workflow.fail("boom").expect("failure edge must exist");
            assert_eq!(workflow.status, WorkflowStatus::Failed);
            assert_eq!(workflow.last_error.as_deref(), Some("boom"));
        }
    }

    #[test]
    fn test_terminal_states_are_final() {
        let mut workflow = mock_workflow();
        workflow.fail("gone").unwrap();
        assert!(workflow.transition(WorkflowStatus::Validated).is_err());
        assert!(workflow.transition(WorkflowStatus::Failed).is_err());
        assert!(workflow.fail("again").is_err());
        // The original failure message survives the duplicate.
        assert_eq!(workflow.last_error.as_deref(), Some("gone"));
    }

    #[test]
    fn test_try_transition_absorbs_duplicates() {
        let handle = Arc::new(RwLock::new(mock_workflow()));
        assert_eq!(try_transition(&handle, WorkflowStatus::Validated), Some(WorkflowStatus::Validated));
        // The duplicate event is a no-op, not a panic or a state change.
        assert_eq!(try_transition(&handle, WorkflowStatus::Validated), None);
        assert_eq!(handle.read().unwrap().status, WorkflowStatus::Validated);
    }

    #[test]
    fn test_status_round_trip_strings() {
        for status in [
            WorkflowStatus::Created,
            WorkflowStatus::PartialFailure,
            WorkflowStatus::Aggregating,
            WorkflowStatus::Completed,
        ] {
            assert!(!status.as_str().is_empty());
        }
        assert_eq!(WorkflowType::parse("ML_TRAINING"), Some(WorkflowType::MlTraining));
        assert_eq!(WorkflowType::parse("NOT_A_TYPE"), None);
    }
}
