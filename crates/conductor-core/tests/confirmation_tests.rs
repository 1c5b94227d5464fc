//! Confirmation policy tests: escalation, decisions and live policy changes

mod common;

use common::*;
use conductor_core::{
    ConfirmationPolicy, Conversation, CoordinatorSettings, Decision, EngineEvent, Error, ExecutionStatus,
    PendingAction, RiskLevel, Script, ScriptStep, ScriptedFactory, SessionEvent, decision_channel,
};
use std::sync::Arc;
use std::time::Duration;

fn action(id: &str, risk: RiskLevel) -> PendingAction {
    PendingAction::new(id, "shell", risk).with_description(format!("{} action", risk))
}

fn factory(script: Script) -> Arc<ScriptedFactory> {
    Arc::new(ScriptedFactory::new(script))
}

mod escalation_tests {
    use super::*;

    #[tokio::test]
    async fn test_confirm_all_escalates_and_accept_proceeds() {
        let factory = factory(Script::new(vec![
            ScriptStep::confirm(vec![action("call-1", RiskLevel::Low), action("call-2", RiskLevel::Medium)]),
            ScriptStep::finish("done"),
        ]));
        let prompt = QueuedPrompt::new(vec![Decision::accept()]);
        let (coordinator, mut events) = start(factory.clone(), prompt.clone(), ConfirmationPolicy::ConfirmAll);

        coordinator.submit_message("s1", "go").await.unwrap();
        let seen = turn_finished(&mut events, "s1").await;

        assert_eq!(
            statuses_for(&seen, "s1"),
            vec![
                ExecutionStatus::Running,
                ExecutionStatus::WaitingForConfirmation,
                ExecutionStatus::Running,
                ExecutionStatus::Finished,
            ]
        );
        assert!(seen.iter().any(|(_, e)| matches!(
            e,
            SessionEvent::StatusChanged { status: ExecutionStatus::WaitingForConfirmation, pending_action_count: 2 }
        )));
        assert!(seen
            .iter()
            .any(|(_, e)| matches!(e, SessionEvent::ConfirmationRequired { actions } if actions.len() == 2)));
        assert_eq!(prompt.escalations(), 1);
        assert_eq!(coordinator.state("s1").await.unwrap().status, ExecutionStatus::Finished);
    }

    #[tokio::test]
    async fn test_auto_approve_all_never_escalates() {
        let factory = factory(Script::new(vec![
            ScriptStep::confirm(vec![action("call-1", RiskLevel::High)]),
            ScriptStep::confirm(vec![action("call-2", RiskLevel::High)]),
            ScriptStep::finish("done"),
        ]));
        let prompt = QueuedPrompt::new(vec![]);
        let (coordinator, mut events) = start(factory.clone(), prompt.clone(), ConfirmationPolicy::AutoApproveAll);

        coordinator.submit_message("s1", "go").await.unwrap();
        let seen = turn_finished(&mut events, "s1").await;

        assert_eq!(prompt.escalations(), 0);
        assert_eq!(
            statuses_for(&seen, "s1"),
            vec![ExecutionStatus::Running, ExecutionStatus::Finished]
        );
        let convo = factory.conversation("s1").unwrap();
        assert!(convo.unmatched_actions(&convo.events()).is_empty());
        assert_eq!(convo.run_calls(), 3);
    }

    #[tokio::test]
    async fn test_threshold_escalates_only_high_risk() {
        let factory = factory(Script::new(vec![
            ScriptStep::confirm(vec![action("call-1", RiskLevel::Medium)]),
            ScriptStep::confirm(vec![action("call-2", RiskLevel::High)]),
            ScriptStep::finish("done"),
        ]));
        let prompt = QueuedPrompt::new(vec![Decision::accept()]);
        let (coordinator, mut events) = start(factory, prompt.clone(), ConfirmationPolicy::risky());

        coordinator.submit_message("s1", "go").await.unwrap();
        turn_finished(&mut events, "s1").await;

        let requests = prompt.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].0, "s1");
        assert_eq!(requests[0].1, vec![action("call-2", RiskLevel::High)]);
    }

    #[tokio::test]
    async fn test_reject_ends_turn_without_more_engine_calls() {
        let factory = factory(Script::new(vec![
            ScriptStep::confirm(vec![action("call-1", RiskLevel::High)]),
            ScriptStep::finish("should not run"),
        ]));
        let prompt = QueuedPrompt::new(vec![Decision::reject()]);
        let (coordinator, mut events) = start(factory.clone(), prompt, ConfirmationPolicy::ConfirmAll);

        coordinator.submit_message("s1", "go").await.unwrap();
        let seen = turn_finished(&mut events, "s1").await;

        assert_eq!(
            statuses_for(&seen, "s1"),
            vec![
                ExecutionStatus::Running,
                ExecutionStatus::WaitingForConfirmation,
                ExecutionStatus::Running,
                ExecutionStatus::Finished,
            ]
        );
        let convo = factory.conversation("s1").unwrap();
        assert_eq!(convo.run_calls(), 1);
        assert!(convo.events().iter().any(|e| matches!(
            e,
            EngineEvent::Rejection { tool_call_id, reason } if tool_call_id == "call-1" && reason == "User rejected the actions"
        )));
    }

    #[tokio::test]
    async fn test_reject_with_reason() {
        let factory = factory(Script::new(vec![ScriptStep::confirm(vec![action("call-1", RiskLevel::High)])]));
        let prompt = QueuedPrompt::new(vec![Decision::reject_with("not on main")]);
        let (coordinator, mut events) = start(factory.clone(), prompt, ConfirmationPolicy::ConfirmAll);

        coordinator.submit_message("s1", "go").await.unwrap();
        turn_finished(&mut events, "s1").await;

        let convo = factory.conversation("s1").unwrap();
        assert!(convo.events().iter().any(|e| matches!(
            e,
            EngineEvent::Rejection { reason, .. } if reason == "not on main"
        )));
    }

    #[tokio::test]
    async fn test_defer_pauses_and_resume_asks_again() {
        let factory = factory(Script::new(vec![
            ScriptStep::confirm(vec![action("call-1", RiskLevel::High)]),
            ScriptStep::finish("done"),
        ]));
        let prompt = QueuedPrompt::new(vec![Decision::defer(), Decision::accept()]);
        let (coordinator, mut events) = start(factory.clone(), prompt.clone(), ConfirmationPolicy::ConfirmAll);

        coordinator.submit_message("s1", "go").await.unwrap();
        turn_finished(&mut events, "s1").await;

        let convo = factory.conversation("s1").unwrap();
        assert_eq!(coordinator.state("s1").await.unwrap().status, ExecutionStatus::Paused);
        assert_eq!(convo.pause_calls(), 1);
        assert_eq!(convo.unmatched_actions(&convo.events()).len(), 1);

        coordinator.resume("s1").await.unwrap();
        turn_finished(&mut events, "s1").await;

        assert_eq!(prompt.escalations(), 2);
        assert_eq!(coordinator.state("s1").await.unwrap().status, ExecutionStatus::Finished);
        assert!(convo.unmatched_actions(&convo.events()).is_empty());
    }

    #[tokio::test]
    async fn test_escalation_error_defers() {
        let factory = factory(Script::new(vec![ScriptStep::confirm(vec![action("call-1", RiskLevel::High)])]));
        // No decisions queued: the prompt errors
        let (coordinator, mut events) = start(factory.clone(), QueuedPrompt::new(vec![]), ConfirmationPolicy::ConfirmAll);

        coordinator.submit_message("s1", "go").await.unwrap();
        turn_finished(&mut events, "s1").await;

        let convo = factory.conversation("s1").unwrap();
        assert_eq!(coordinator.state("s1").await.unwrap().status, ExecutionStatus::Paused);
        assert_eq!(convo.unmatched_actions(&convo.events()).len(), 1);
    }

    #[tokio::test]
    async fn test_escalation_timeout_defers() {
        let factory = factory(Script::new(vec![ScriptStep::confirm(vec![action("call-1", RiskLevel::High)])]));
        let settings = CoordinatorSettings {
            escalation_timeout: Duration::from_millis(200),
            ..CoordinatorSettings::default()
        };
        let prompt = QueuedPrompt::hanging();
        let (coordinator, mut events) = start_with(factory.clone(), prompt.clone(), settings);

        coordinator.submit_message("s1", "go").await.unwrap();
        turn_finished(&mut events, "s1").await;

        assert_eq!(prompt.escalations(), 1);
        assert_eq!(coordinator.state("s1").await.unwrap().status, ExecutionStatus::Paused);
        assert_eq!(factory.conversation("s1").unwrap().pause_calls(), 1);
    }

    #[tokio::test]
    async fn test_reloaded_waiting_conversation_resolves_before_running() {
        let script = Script::finish("picked up where we left off").with_pending(vec![action("call-0", RiskLevel::Low)]);
        let factory = factory(script);
        let prompt = QueuedPrompt::new(vec![]);
        let (coordinator, mut events) = start(factory.clone(), prompt.clone(), ConfirmationPolicy::AutoApproveAll);

        coordinator.resume("s1").await.unwrap();
        turn_finished(&mut events, "s1").await;

        let convo = factory.conversation("s1").unwrap();
        assert_eq!(prompt.escalations(), 0);
        assert_eq!(convo.run_calls(), 1);
        assert!(convo.unmatched_actions(&convo.events()).is_empty());
        assert_eq!(coordinator.state("s1").await.unwrap().status, ExecutionStatus::Finished);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_resume_with_live_worker_is_refused() {
        let factory = factory(Script::new(vec![ScriptStep::stall(10_000)]));
        let (coordinator, _events) = start(factory, QueuedPrompt::new(vec![]), ConfirmationPolicy::ConfirmAll);

        coordinator.submit_message("s1", "work").await.unwrap();
        assert!(matches!(coordinator.resume("s1").await, Err(Error::InvariantViolation(_))));
        coordinator.request_cancel("s1", Duration::from_secs(3)).await.unwrap();
    }

    #[tokio::test]
    async fn test_channel_prompt_round_trip() {
        let factory = factory(Script::new(vec![
            ScriptStep::confirm(vec![action("call-1", RiskLevel::High)]),
            ScriptStep::finish("done"),
        ]));
        let (prompt, mut requests) = decision_channel(4);
        let (coordinator, mut events) = start(factory, Arc::new(prompt), ConfirmationPolicy::ConfirmAll);

        let responder = tokio::spawn(async move {
            let request = requests.recv().await.unwrap();
            assert_eq!(request.session_id, "s1");
            assert_eq!(request.actions.len(), 1);
            request.respond(Decision::accept())
        });

        coordinator.submit_message("s1", "go").await.unwrap();
        turn_finished(&mut events, "s1").await;
        assert!(responder.await.unwrap());
        assert_eq!(coordinator.state("s1").await.unwrap().status, ExecutionStatus::Finished);
    }
}

mod policy_change_tests {
    use super::*;

    #[tokio::test]
    async fn test_always_proceed_stops_asking_mid_turn() {
        let factory = factory(Script::new(vec![
            ScriptStep::confirm(vec![action("call-1", RiskLevel::Low)]),
            ScriptStep::confirm(vec![action("call-2", RiskLevel::High)]),
            ScriptStep::finish("done"),
        ]));
        let prompt = QueuedPrompt::new(vec![Decision::always_proceed()]);
        let (coordinator, mut events) = start(factory.clone(), prompt.clone(), ConfirmationPolicy::ConfirmAll);

        coordinator.request_switch("s1").await.unwrap();
        coordinator.submit_message("s1", "go").await.unwrap();
        let seen = turn_finished(&mut events, "s1").await;

        assert_eq!(prompt.escalations(), 1);
        assert!(seen.iter().any(|(_, e)| matches!(
            e,
            SessionEvent::PolicyChanged { policy: ConfirmationPolicy::AutoApproveAll }
        )));
        assert_eq!(
            coordinator.confirmation_policy().await.unwrap(),
            ConfirmationPolicy::AutoApproveAll
        );
        assert_eq!(
            coordinator.state("s1").await.unwrap().policy,
            ConfirmationPolicy::AutoApproveAll
        );
        assert_eq!(
            factory.conversation("s1").unwrap().last_policy(),
            Some(ConfirmationPolicy::AutoApproveAll)
        );
    }

    #[tokio::test]
    async fn test_confirm_risky_installs_high_threshold() {
        let factory = factory(Script::new(vec![
            ScriptStep::confirm(vec![action("call-1", RiskLevel::Low)]),
            ScriptStep::confirm(vec![action("call-2", RiskLevel::Medium)]),
            ScriptStep::confirm(vec![action("call-3", RiskLevel::High)]),
            ScriptStep::finish("done"),
        ]));
        let prompt = QueuedPrompt::new(vec![Decision::confirm_risky(), Decision::accept()]);
        let (coordinator, mut events) = start(factory, prompt.clone(), ConfirmationPolicy::ConfirmAll);

        coordinator.request_switch("s1").await.unwrap();
        coordinator.submit_message("s1", "go").await.unwrap();
        turn_finished(&mut events, "s1").await;

        let requests = prompt.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].1[0].tool_call_id, "call-1");
        assert_eq!(requests[1].1[0].tool_call_id, "call-3");
        assert_eq!(
            coordinator.confirmation_policy().await.unwrap(),
            ConfirmationPolicy::ConfirmAboveThreshold(RiskLevel::High)
        );
    }

    #[tokio::test]
    async fn test_decision_in_background_session_keeps_coordinator_policy() {
        let factory = factory(Script::new(vec![
            ScriptStep::confirm(vec![action("call-1", RiskLevel::Low)]),
            ScriptStep::finish("done"),
        ]));
        let prompt = QueuedPrompt::new(vec![Decision::always_proceed()]);
        let (coordinator, mut events) = start(factory, prompt, ConfirmationPolicy::ConfirmAll);

        coordinator.submit_message("background", "go").await.unwrap();
        turn_finished(&mut events, "background").await;

        assert_eq!(
            coordinator.state("background").await.unwrap().policy,
            ConfirmationPolicy::AutoApproveAll
        );
        assert_eq!(coordinator.confirmation_policy().await.unwrap(), ConfirmationPolicy::ConfirmAll);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_facade_policy_change_applies_at_next_check() {
        let factory = factory(Script::new(vec![
            ScriptStep::stall(300),
            ScriptStep::confirm(vec![action("call-1", RiskLevel::High)]),
            ScriptStep::finish("done"),
        ]));
        let prompt = QueuedPrompt::new(vec![]);
        let (coordinator, mut events) = start(factory.clone(), prompt.clone(), ConfirmationPolicy::ConfirmAll);

        coordinator.request_switch("s1").await.unwrap();
        coordinator.submit_message("s1", "go").await.unwrap();
        let convo = factory.conversation("s1").unwrap();
        wait_until(|| convo.is_running()).await;

        coordinator
            .set_confirmation_policy(ConfirmationPolicy::AutoApproveAll)
            .await
            .unwrap();
        let seen = turn_finished(&mut events, "s1").await;

        assert_eq!(prompt.escalations(), 0);
        assert!(seen.iter().any(|(_, e)| matches!(
            e,
            SessionEvent::PolicyChanged { policy: ConfirmationPolicy::AutoApproveAll }
        )));
        assert_eq!(coordinator.state("s1").await.unwrap().status, ExecutionStatus::Finished);
        wait_until(|| convo.last_policy() == Some(ConfirmationPolicy::AutoApproveAll)).await;
    }

    #[tokio::test]
    async fn test_policy_change_reaches_unfocused_running_session() {
        let factory = factory(Script::new(vec![
            ScriptStep::stall(300),
            ScriptStep::confirm(vec![action("call-1", RiskLevel::High)]),
            ScriptStep::finish("done"),
        ]));
        let prompt = QueuedPrompt::new(vec![]);
        let (coordinator, mut events) = start(factory.clone(), prompt.clone(), ConfirmationPolicy::ConfirmAll);

        coordinator.submit_message("s1", "go").await.unwrap();
        assert_eq!(coordinator.current_session().await.unwrap(), None);
        let convo = factory.conversation("s1").unwrap();
        wait_until(|| convo.is_running()).await;

        coordinator
            .set_confirmation_policy(ConfirmationPolicy::AutoApproveAll)
            .await
            .unwrap();
        let seen = turn_finished(&mut events, "s1").await;

        assert_eq!(prompt.escalations(), 0);
        assert!(seen.iter().any(|(id, e)| id == "s1"
            && matches!(e, SessionEvent::PolicyChanged { policy: ConfirmationPolicy::AutoApproveAll })));
        assert_eq!(
            coordinator.state("s1").await.unwrap().policy,
            coordinator.confirmation_policy().await.unwrap()
        );
        wait_until(|| convo.last_policy() == Some(ConfirmationPolicy::AutoApproveAll)).await;
    }

    #[tokio::test]
    async fn test_policy_set_without_active_session_is_sticky() {
        let factory = factory(Script::finish("ok"));
        let (coordinator, _events) = start(factory, QueuedPrompt::new(vec![]), ConfirmationPolicy::ConfirmAll);

        coordinator.set_confirmation_policy(ConfirmationPolicy::risky()).await.unwrap();
        coordinator.submit_message("later", "hi").await.unwrap();
        assert_eq!(
            coordinator.state("later").await.unwrap().policy,
            ConfirmationPolicy::risky()
        );
    }
}
