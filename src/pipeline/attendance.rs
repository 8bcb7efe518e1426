//! Face match and gesture attendance.
//!
//! Faces come from the perception backend and are matched against the
//! source's cached templates. Each accepted match may raise `face_matched`;
//! if the frame also shows a thumb gesture, an attendance row is written for
//! that identity and gesture.

use anyhow::{Context, Result};
use serde_json::json;
use std::time::Instant;

use super::{Outcome, Pipeline, PipelineContext, PipelineKind};
use crate::debounce::DebounceKey;
use crate::events::EventKind;
use crate::frame::{now_ms, Frame};
use crate::identity::{first_gesture, FaceMatch, Gesture};
use crate::store::{AttendanceRecord, SourceRecord};

pub struct AttendancePipeline {
    source_id: String,
    ctx: PipelineContext,
}

impl AttendancePipeline {
    pub fn new(source: &SourceRecord, ctx: PipelineContext) -> Self {
        Self {
            source_id: source.id.clone(),
            ctx,
        }
    }

    fn announce_match(&self, matched: &FaceMatch, now: Instant, events: &mut Vec<u64>) {
        let identity = &matched.template.identity;
        let key = DebounceKey::subject(&self.source_id, PipelineKind::Attendance, &identity.external_id);
        let debouncer = self.ctx.debounce.for_kind(PipelineKind::Attendance);
        if !debouncer.try_fire(key, self.ctx.identity.face_window, now) {
            return;
        }
        log::info!(
            "source {}: matched {} ({}) at distance {:.3}",
            self.source_id,
            identity.name,
            identity.external_id,
            matched.distance
        );
        events.push(self.ctx.events.append(
            EventKind::FaceMatched,
            json!({
                "employee_name": identity.name,
                "employee_id": identity.external_id,
                "department": identity.department,
                "designation": identity.designation,
                "camera_id": self.source_id,
                "distance": matched.distance,
            }),
        ));
    }

    fn record_attendance(
        &self,
        matched: &FaceMatch,
        gesture: Gesture,
        now: Instant,
        events: &mut Vec<u64>,
    ) {
        let identity = &matched.template.identity;
        let key = DebounceKey::gesture(
            &self.source_id,
            PipelineKind::Attendance,
            &identity.external_id,
            gesture,
        );
        let debouncer = self.ctx.debounce.for_kind(PipelineKind::Attendance);
        if !debouncer.try_fire(key, self.ctx.identity.attendance_window, now) {
            log::debug!(
                "source {}: {} for {} already recorded recently",
                self.source_id,
                gesture,
                identity.external_id
            );
            return;
        }

        let record = AttendanceRecord {
            external_id: identity.external_id.clone(),
            source_id: self.source_id.clone(),
            gesture,
            created_at_ms: now_ms(),
        };
        // A failed write keeps its debounce slot; the next chance is after the window.
        if let Err(err) = self.ctx.sink.insert_attendance(&record) {
            log::error!(
                "failed to record attendance for {} on source {}: {:#}",
                identity.external_id,
                self.source_id,
                err
            );
            return;
        }
        log::info!(
            "source {}: {} for {}",
            self.source_id,
            gesture.action(),
            identity.name
        );
        events.push(self.ctx.events.append(
            EventKind::AttendanceLogged,
            json!({
                "employee_name": identity.name,
                "employee_id": identity.external_id,
                "action": gesture.action(),
                "camera_id": self.source_id,
                "gesture": gesture.as_str(),
            }),
        ));
    }
}

impl Pipeline for AttendancePipeline {
    fn kind(&self) -> PipelineKind {
        PipelineKind::Attendance
    }

    fn process(&mut self, frame: &Frame, now: Instant) -> Result<Outcome> {
        if !self.ctx.claim_rate(&self.source_id, PipelineKind::Attendance, now) {
            return Ok(Outcome::RateLimited);
        }

        let faces = self.ctx.perception.faces(frame).context("detect faces")?;
        if faces.is_empty() {
            return Ok(Outcome::Completed { events: Vec::new() });
        }
        let matches = self
            .ctx
            .biometrics
            .match_faces(&self.source_id, &faces, self.ctx.identity.match_threshold)
            .context("match faces")?;
        if matches.is_empty() {
            return Ok(Outcome::Completed { events: Vec::new() });
        }

        let mut events = Vec::new();
        for matched in &matches {
            self.announce_match(matched, now, &mut events);
        }

        let hands = self.ctx.perception.hands(frame).context("detect hands")?;
        let gesture = first_gesture(&hands);
        if gesture != Gesture::None {
            for matched in &matches {
                self.record_attendance(matched, gesture, now, &mut events);
            }
        }
        Ok(Outcome::Completed { events })
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::{harness, source, Harness};
    use super::*;
    use crate::identity::encode_template;
    use crate::identity::gesture::fixtures;
    use crate::perception::FaceObservation;
    use std::time::Duration;

    fn frame() -> Frame {
        Frame::filled(8, 8, [90, 90, 90]).unwrap()
    }

    fn face(embedding: Vec<f32>) -> FaceObservation {
        FaceObservation {
            embedding,
            bbox: None,
        }
    }

    fn enrolled() -> Harness {
        let h = harness(2);
        h.store.add_identity("E1", "Ada", &encode_template(&[0.3, 0.0]));
        h.store.add_identity("E2", "Grace", &encode_template(&[0.8, 0.0]));
        h
    }

    fn events_of(h: &Harness, kind: EventKind) -> usize {
        h.ctx
            .events
            .since(0)
            .iter()
            .filter(|e| e.kind() == kind)
            .count()
    }

    #[test]
    fn closest_template_under_threshold_is_announced() -> Result<()> {
        let h = enrolled();
        h.perception.set_faces(vec![face(vec![0.0, 0.0])]);
        let mut pipeline = AttendancePipeline::new(&source(), h.ctx.clone());
        pipeline.process(&frame(), Instant::now())?;

        let event = &h.ctx.events.latest(1)[0];
        assert_eq!(event.kind(), EventKind::FaceMatched);
        assert_eq!(event.data()["employee_id"], "E1");
        assert_eq!(event.data()["camera_id"], "cam1");
        Ok(())
    }

    #[test]
    fn templates_above_threshold_produce_nothing() -> Result<()> {
        let h = harness(2);
        h.store.add_identity("E1", "Ada", &encode_template(&[0.6, 0.0]));
        h.store.add_identity("E2", "Grace", &encode_template(&[0.8, 0.0]));
        h.perception.set_faces(vec![face(vec![0.0, 0.0])]);
        h.perception.set_hands(vec![fixtures::thumb_up()]);
        let mut pipeline = AttendancePipeline::new(&source(), h.ctx.clone());
        pipeline.process(&frame(), Instant::now())?;

        assert!(h.ctx.events.is_empty());
        assert!(h.store.attendance().is_empty());
        Ok(())
    }

    #[test]
    fn double_trigger_inside_window_records_once() -> Result<()> {
        let h = enrolled();
        h.perception.set_faces(vec![face(vec![0.0, 0.0])]);
        h.perception.set_hands(vec![fixtures::thumb_up()]);
        let mut pipeline = AttendancePipeline::new(&source(), h.ctx.clone());

        let t0 = Instant::now();
        pipeline.process(&frame(), t0)?;
        // Past the 2 s rate interval, inside the 10 s attendance window.
        pipeline.process(&frame(), t0 + Duration::from_secs(6))?;

        let records = h.store.attendance();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].external_id, "E1");
        assert_eq!(records[0].gesture, Gesture::ThumbUp);
        assert_eq!(events_of(&h, EventKind::AttendanceLogged), 1);
        assert_eq!(events_of(&h, EventKind::FaceMatched), 2);

        pipeline.process(&frame(), t0 + Duration::from_secs(10))?;
        assert_eq!(h.store.attendance().len(), 2);
        assert_eq!(events_of(&h, EventKind::AttendanceLogged), 2);
        Ok(())
    }

    #[test]
    fn check_in_and_check_out_are_separate_keys() -> Result<()> {
        let h = enrolled();
        h.perception.set_faces(vec![face(vec![0.0, 0.0])]);
        h.perception.set_hands(vec![fixtures::thumb_up()]);
        let mut pipeline = AttendancePipeline::new(&source(), h.ctx.clone());

        let t0 = Instant::now();
        pipeline.process(&frame(), t0)?;
        h.perception.set_hands(vec![fixtures::thumb_down()]);
        pipeline.process(&frame(), t0 + Duration::from_secs(3))?;

        let gestures: Vec<Gesture> = h.store.attendance().iter().map(|r| r.gesture).collect();
        assert_eq!(gestures, vec![Gesture::ThumbUp, Gesture::ThumbDown]);
        let last = &h.ctx.events.latest(1)[0];
        assert_eq!(last.data()["action"], "Check Out");
        Ok(())
    }

    #[test]
    fn failed_write_keeps_debounce_slot() -> Result<()> {
        let h = enrolled();
        h.perception.set_faces(vec![face(vec![0.0, 0.0])]);
        h.perception.set_hands(vec![fixtures::thumb_up()]);
        h.store.fail_attendance(true);
        let mut pipeline = AttendancePipeline::new(&source(), h.ctx.clone());

        let t0 = Instant::now();
        pipeline.process(&frame(), t0)?;
        h.store.fail_attendance(false);
        pipeline.process(&frame(), t0 + Duration::from_secs(4))?;
        assert!(h.store.attendance().is_empty());
        assert_eq!(events_of(&h, EventKind::AttendanceLogged), 0);

        pipeline.process(&frame(), t0 + Duration::from_secs(10))?;
        assert_eq!(h.store.attendance().len(), 1);
        Ok(())
    }

    #[test]
    fn open_palm_logs_no_attendance() -> Result<()> {
        let h = enrolled();
        h.perception.set_faces(vec![face(vec![0.0, 0.0])]);
        h.perception.set_hands(vec![fixtures::open_palm()]);
        let mut pipeline = AttendancePipeline::new(&source(), h.ctx.clone());
        pipeline.process(&frame(), Instant::now())?;
        assert!(h.store.attendance().is_empty());
        assert_eq!(events_of(&h, EventKind::FaceMatched), 1);
        Ok(())
    }

    #[test]
    fn registry_failure_surfaces_as_error() {
        let h = enrolled();
        h.store.fail_identity_loads(true);
        h.perception.set_faces(vec![face(vec![0.0, 0.0])]);
        let mut pipeline = AttendancePipeline::new(&source(), h.ctx.clone());
        assert!(pipeline.process(&frame(), Instant::now()).is_err());
    }
}
