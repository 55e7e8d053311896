use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use shared::{
    domain::{ParticipantId, SessionId},
    error::ApiException,
    protocol::{MonitorEvent, ParticipantSummary, SessionOverview, SessionSummary},
    task::LiveEvent,
};
use storage::{Storage, StoredParticipant, StoredSession};
use tracing::debug;
use uuid::Uuid;

#[derive(Clone)]
pub struct ApiContext {
    pub storage: Storage,
}

const MAX_LABEL_BYTES: usize = 80;

pub async fn create_session(
    ctx: &ApiContext,
    label: Option<&str>,
) -> Result<SessionSummary, ApiException> {
    let label = normalize_label(label)?;
    let session = ctx
        .storage
        .create_session(&new_code(), label)
        .await
        .map_err(internal)?;
    Ok(summarize_session(session))
}

pub async fn join_session(
    ctx: &ApiContext,
    session_code: &str,
    label: Option<&str>,
) -> Result<ParticipantSummary, ApiException> {
    let label = normalize_label(label)?;
    let session = ctx
        .storage
        .session_by_code(session_code)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiException::not_found("session not found"))?;

    let participant = ctx
        .storage
        .create_participant(session.session_id, &new_code(), label)
        .await
        .map_err(internal)?;
    Ok(summarize_participant(participant))
}

pub async fn session_overview(
    ctx: &ApiContext,
    session_code: &str,
) -> Result<SessionOverview, ApiException> {
    let session = ctx
        .storage
        .session_by_code(session_code)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiException::not_found("session not found"))?;
    let participants = ctx
        .storage
        .list_participants_for_session(session.session_id)
        .await
        .map_err(internal)?;

    Ok(SessionOverview {
        session: summarize_session(session),
        participants: participants.into_iter().map(summarize_participant).collect(),
    })
}

pub async fn participant_progress(
    ctx: &ApiContext,
    participant_code: &str,
) -> Result<ParticipantSummary, ApiException> {
    let participant = ctx
        .storage
        .participant_by_code(participant_code)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiException::not_found("participant not found"))?;
    Ok(summarize_participant(participant))
}

pub async fn advance_participant(
    ctx: &ApiContext,
    participant_code: &str,
) -> Result<(ParticipantSummary, Option<MonitorEvent>), ApiException> {
    let participant = ctx
        .storage
        .participant_by_code(participant_code)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiException::not_found("participant not found"))?;
    let (advanced_at, newly_advanced) = ctx
        .storage
        .mark_advanced(participant.participant_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiException::not_found("participant not found"))?;

    let mut summary = summarize_participant(participant);
    summary.advanced_at = Some(advanced_at);
    let event = newly_advanced.then(|| MonitorEvent::ParticipantAdvanced {
        session_id: summary.session_id,
        participant_id: summary.participant_id,
        advanced_at,
    });
    Ok((summary, event))
}

/// Records one live-channel payload against a participant's counters.
///
/// Recognized tokens load the participant's progress, apply the increment,
/// and write it back, yielding a monitor event with the new counts.
/// Unrecognized payloads change nothing and yield nothing; the channel never
/// sees a failure for them.
pub async fn record_live_event(
    ctx: &ApiContext,
    session_id: SessionId,
    participant_id: ParticipantId,
    raw: &str,
) -> Result<Option<MonitorEvent>, ApiException> {
    let event = LiveEvent::decode(raw);
    if let LiveEvent::Unknown(payload) = &event {
        debug!(
            participant = participant_id.0,
            payload = payload.as_str(),
            "ignoring unrecognized live event"
        );
        return Ok(None);
    }

    let mut progress = ctx
        .storage
        .task_progress(participant_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiException::not_found("participant not found"))?;
    progress.apply(&event);
    ctx.storage
        .save_task_progress(participant_id, progress)
        .await
        .map_err(internal)?;

    Ok(Some(MonitorEvent::ProgressUpdated {
        session_id,
        participant_id,
        progress,
    }))
}

fn new_code() -> String {
    URL_SAFE_NO_PAD.encode(Uuid::new_v4().as_bytes())
}

fn normalize_label(label: Option<&str>) -> Result<Option<&str>, ApiException> {
    let label = label.map(str::trim).filter(|label| !label.is_empty());
    if let Some(label) = label {
        if label.len() > MAX_LABEL_BYTES {
            return Err(ApiException::validation("label is too long"));
        }
    }
    Ok(label)
}

fn summarize_session(session: StoredSession) -> SessionSummary {
    SessionSummary {
        session_id: session.session_id,
        code: session.code,
        label: session.label,
        created_at: session.created_at,
    }
}

fn summarize_participant(participant: StoredParticipant) -> ParticipantSummary {
    ParticipantSummary {
        participant_id: participant.participant_id,
        session_id: participant.session_id,
        code: participant.code,
        label: participant.label,
        progress: participant.progress,
        advanced_at: participant.advanced_at,
        last_event_at: participant.last_event_at,
        joined_at: participant.created_at,
    }
}

fn internal(err: anyhow::Error) -> ApiException {
    ApiException::internal(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::error::ErrorCode;
    use shared::task::TaskProgress;

    async fn setup() -> (ApiContext, SessionSummary, ParticipantSummary) {
        let storage = Storage::new("sqlite::memory:").await.expect("db");
        let ctx = ApiContext { storage };
        let session = create_session(&ctx, Some("pilot")).await.expect("session");
        let participant = join_session(&ctx, &session.code, Some("alice"))
            .await
            .expect("participant");
        (ctx, session, participant)
    }

    #[tokio::test]
    async fn joining_unknown_session_fails_with_not_found() {
        let storage = Storage::new("sqlite::memory:").await.expect("db");
        let ctx = ApiContext { storage };
        let err = join_session(&ctx, "missing", None)
            .await
            .expect_err("should fail");
        assert!(matches!(err.code, ErrorCode::NotFound));
    }

    #[tokio::test]
    async fn overlong_label_is_rejected() {
        let storage = Storage::new("sqlite::memory:").await.expect("db");
        let ctx = ApiContext { storage };
        let label = "x".repeat(MAX_LABEL_BYTES + 1);
        let err = create_session(&ctx, Some(&label))
            .await
            .expect_err("should fail");
        assert!(matches!(err.code, ErrorCode::Validation));
    }

    #[tokio::test]
    async fn fresh_participant_starts_at_zero() {
        let (_ctx, _session, participant) = setup().await;
        assert_eq!(participant.progress, TaskProgress::default());
        assert!(participant.advanced_at.is_none());
    }

    #[tokio::test]
    async fn recognized_tokens_increment_their_counter() {
        let (ctx, session, participant) = setup().await;

        let event = record_live_event(
            &ctx,
            session.session_id,
            participant.participant_id,
            "sorted",
        )
        .await
        .expect("record")
        .expect("monitor event");
        match event {
            MonitorEvent::ProgressUpdated { progress, .. } => {
                assert_eq!(progress.shapes_sorted, 1);
                assert_eq!(progress.rounds_completed, 0);
            }
            other => panic!("unexpected monitor event: {other:?}"),
        }

        record_live_event(
            &ctx,
            session.session_id,
            participant.participant_id,
            "completed",
        )
        .await
        .expect("record");

        let reloaded = participant_progress(&ctx, &participant.code)
            .await
            .expect("progress");
        assert_eq!(reloaded.progress.shapes_sorted, 1);
        assert_eq!(reloaded.progress.rounds_completed, 1);
        assert!(reloaded.last_event_at.is_some());
    }

    #[tokio::test]
    async fn event_sequence_matches_expected_counts() {
        let (ctx, session, participant) = setup().await;
        for raw in ["sorted", "sorted", "completed", "bogus", "sorted"] {
            record_live_event(&ctx, session.session_id, participant.participant_id, raw)
                .await
                .expect("record");
        }

        let reloaded = participant_progress(&ctx, &participant.code)
            .await
            .expect("progress");
        assert_eq!(reloaded.progress.shapes_sorted, 3);
        assert_eq!(reloaded.progress.rounds_completed, 1);
    }

    #[tokio::test]
    async fn unrecognized_payload_is_a_silent_noop() {
        let (ctx, session, participant) = setup().await;
        let outcome = record_live_event(
            &ctx,
            session.session_id,
            participant.participant_id,
            "shuffled",
        )
        .await
        .expect("record");
        assert!(outcome.is_none());

        let reloaded = participant_progress(&ctx, &participant.code)
            .await
            .expect("progress");
        assert_eq!(reloaded.progress, TaskProgress::default());
        assert!(reloaded.last_event_at.is_none());
    }

    #[tokio::test]
    async fn json_encoded_tokens_are_accepted() {
        let (ctx, session, participant) = setup().await;
        record_live_event(
            &ctx,
            session.session_id,
            participant.participant_id,
            "\"sorted\"",
        )
        .await
        .expect("record");

        let reloaded = participant_progress(&ctx, &participant.code)
            .await
            .expect("progress");
        assert_eq!(reloaded.progress.shapes_sorted, 1);
    }

    #[tokio::test]
    async fn participants_do_not_share_counters() {
        let (ctx, session, alice) = setup().await;
        let bob = join_session(&ctx, &session.code, Some("bob"))
            .await
            .expect("participant");

        record_live_event(&ctx, session.session_id, alice.participant_id, "sorted")
            .await
            .expect("record");

        let bob_progress = participant_progress(&ctx, &bob.code)
            .await
            .expect("progress");
        assert_eq!(bob_progress.progress, TaskProgress::default());

        let overview = session_overview(&ctx, &session.code).await.expect("overview");
        assert_eq!(overview.participants.len(), 2);
        assert_eq!(overview.participants[0].progress.shapes_sorted, 1);
        assert_eq!(overview.participants[1].progress.shapes_sorted, 0);
    }

    #[tokio::test]
    async fn advancing_twice_emits_one_monitor_event() {
        let (ctx, _session, participant) = setup().await;

        let (first, event) = advance_participant(&ctx, &participant.code)
            .await
            .expect("advance");
        assert!(first.advanced_at.is_some());
        assert!(matches!(
            event,
            Some(MonitorEvent::ParticipantAdvanced { .. })
        ));

        let (second, event) = advance_participant(&ctx, &participant.code)
            .await
            .expect("advance");
        assert_eq!(second.advanced_at, first.advanced_at);
        assert!(event.is_none());
    }
}
