//! Fire, helmet-compliance and activity pipelines.
//!
//! Each sampled frame is JPEG-encoded, sent to the vision model with a fixed
//! instruction, and the free-text reply is mapped onto a `Verdict` by
//! case-insensitive substring rules. Negative phrases are checked before
//! positive ones, so "No fire detected" can never read as a fire.

use anyhow::{Context, Result};
use serde_json::{json, Value};
use std::time::Instant;

use super::{Outcome, Pipeline, PipelineContext, PipelineKind};
use crate::events::EventKind;
use crate::frame::{now_ms, Frame, ANALYSIS_JPEG_QUALITY};
use crate::store::{ComplianceRecord, HazardRecord, SourceRecord};
use crate::vision::VisionReply;

const FIRE_INSTRUCTION: &str = "Analyze this image for fire or smoke. Look for flames, smoke, or signs of fire. Respond with either 'Fire detected' if you see fire, flames, or significant smoke, or 'No fire detected' if the scene appears normal.";

const HELMET_INSTRUCTION: &str = "Analyze this image for safety helmet compliance. Look for people and determine if they are wearing safety helmets. Respond with either 'Helmet detected' if you see a person wearing a helmet, or 'No helmet detected' if you see a person without a helmet. If no people are visible, respond with 'No people detected'.";

const ACTIVITY_INSTRUCTION: &str = "Check this CCTV image for suspicious or dangerous human activities like fighting, falling down, loitering, or aggressive behavior. Respond in simple summary.";

/// Instruction sent with each frame of a hazard kind.
pub fn instruction(kind: PipelineKind) -> &'static str {
    match kind {
        PipelineKind::Fire => FIRE_INSTRUCTION,
        PipelineKind::Helmet => HELMET_INSTRUCTION,
        PipelineKind::Activity | PipelineKind::Attendance => ACTIVITY_INSTRUCTION,
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    FireClear,
    FireDetected,
    HelmetPresent,
    HelmetViolation,
    ActivityClear,
    ActivityDetected,
    /// Nobody in view; nothing to judge.
    NoPeople,
    /// The reply matched no rule.
    Indeterminate,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::FireClear => "fire_clear",
            Verdict::FireDetected => "fire_detected",
            Verdict::HelmetPresent => "helmet_detection",
            Verdict::HelmetViolation => "helmet_violation",
            Verdict::ActivityClear => "activity_clear",
            Verdict::ActivityDetected => "activity_detected",
            Verdict::NoPeople => "no_people",
            Verdict::Indeterminate => "indeterminate",
        }
    }

    pub fn event_kind(&self) -> Option<EventKind> {
        match self {
            Verdict::FireClear => Some(EventKind::FireClear),
            Verdict::FireDetected => Some(EventKind::FireDetected),
            Verdict::HelmetPresent => Some(EventKind::HelmetDetection),
            Verdict::HelmetViolation => Some(EventKind::HelmetViolation),
            Verdict::ActivityClear => Some(EventKind::ActivityClear),
            Verdict::ActivityDetected => Some(EventKind::ActivityDetected),
            Verdict::NoPeople | Verdict::Indeterminate => None,
        }
    }
}

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|n| haystack.contains(n))
}

/// Map a model reply onto a verdict for `kind`.
pub fn classify(kind: PipelineKind, reply: &str) -> Verdict {
    let text = reply.to_lowercase();
    match kind {
        PipelineKind::Fire => {
            if contains_any(&text, &["no fire detected", "normal"]) {
                Verdict::FireClear
            } else if contains_any(&text, &["fire detected", "fire", "smoke"]) {
                Verdict::FireDetected
            } else {
                Verdict::Indeterminate
            }
        }
        PipelineKind::Helmet => {
            if contains_any(&text, &["no helmet detected", "without a helmet"]) {
                Verdict::HelmetViolation
            } else if contains_any(&text, &["helmet detected", "wearing a helmet"]) {
                Verdict::HelmetPresent
            } else if text.contains("no people detected") {
                Verdict::NoPeople
            } else {
                Verdict::Indeterminate
            }
        }
        PipelineKind::Activity | PipelineKind::Attendance => {
            if text.contains("no people") {
                Verdict::NoPeople
            } else if contains_any(&text, &["no suspicious", "normal", "nothing unusual"]) {
                Verdict::ActivityClear
            } else {
                Verdict::ActivityDetected
            }
        }
    }
}

/// One hazard pipeline bound to one source.
pub struct HazardPipeline {
    kind: PipelineKind,
    source_id: String,
    source_name: String,
    ctx: PipelineContext,
}

impl HazardPipeline {
    pub fn new(kind: PipelineKind, source: &SourceRecord, ctx: PipelineContext) -> Self {
        Self {
            kind,
            source_id: source.id.clone(),
            source_name: source.name.clone(),
            ctx,
        }
    }

    fn persist(&self, verdict: Verdict, reply: &str) -> Result<()> {
        let created_at_ms = now_ms();
        match self.kind {
            PipelineKind::Helmet => self.ctx.sink.insert_compliance(&ComplianceRecord {
                source_id: self.source_id.clone(),
                source_name: self.source_name.clone(),
                verdict: verdict.as_str().to_string(),
                detected: reply.to_string(),
                created_at_ms,
            }),
            category => self.ctx.sink.insert_hazard(&HazardRecord {
                source_id: self.source_id.clone(),
                source_name: self.source_name.clone(),
                category,
                verdict: verdict.as_str().to_string(),
                detected: reply.to_string(),
                created_at_ms,
            }),
        }
    }

    fn payload(&self, verdict: Verdict, reply: &str) -> Value {
        let name = &self.source_name;
        match verdict {
            Verdict::FireDetected => json!({
                "camera_id": self.source_id,
                "camera_name": name,
                "detected": reply,
                "alert_level": "critical",
                "emergency": true,
                "requires_immediate_action": true,
                "evacuation_recommended": true,
                "message": format!("EMERGENCY: Fire/smoke detected at {name}! Immediate action required."),
            }),
            Verdict::FireClear => json!({
                "camera_id": self.source_id,
                "camera_name": name,
                "detected": reply,
                "alert_level": "normal",
                "emergency": false,
                "requires_immediate_action": false,
                "message": format!("All clear: No fire detected at {name}"),
            }),
            Verdict::HelmetViolation => json!({
                "camera_id": self.source_id,
                "camera_name": name,
                "detected": reply,
                "violation_type": "no_helmet",
                "severity": "high",
                "requires_action": true,
                "message": format!("Safety violation: Person without helmet detected at {name}"),
            }),
            Verdict::HelmetPresent => json!({
                "camera_id": self.source_id,
                "camera_name": name,
                "detected": reply,
                "violation_type": "helmet_present",
                "severity": "low",
                "requires_action": false,
                "message": format!("Safety compliance: Person wearing helmet detected at {name}"),
            }),
            Verdict::ActivityClear => json!({
                "camera_id": self.source_id,
                "camera_name": name,
                "activity": reply,
                "message": format!("No suspicious activity at {name}"),
            }),
            _ => json!({
                "camera_id": self.source_id,
                "camera_name": name,
                "activity": reply,
            }),
        }
    }
}

impl Pipeline for HazardPipeline {
    fn kind(&self) -> PipelineKind {
        self.kind
    }

    fn process(&mut self, frame: &Frame, now: Instant) -> Result<Outcome> {
        if !self.ctx.claim_rate(&self.source_id, self.kind, now) {
            return Ok(Outcome::RateLimited);
        }

        let jpeg = frame
            .encode_jpeg(ANALYSIS_JPEG_QUALITY)
            .context("encode frame for vision")?;
        let reply = match self.ctx.vision.answer(&jpeg, instruction(self.kind), self.kind)? {
            VisionReply::Text(text) => text,
            VisionReply::NotReady => return Ok(Outcome::NotReady),
        };

        let verdict = classify(self.kind, &reply);
        log::info!(
            "{} on source {}: {} ({:?})",
            self.kind,
            self.source_id,
            verdict.as_str(),
            reply
        );

        if let Err(err) = self.persist(verdict, &reply) {
            log::error!(
                "failed to persist {} verdict for source {}: {:#}",
                self.kind,
                self.source_id,
                err
            );
        }

        let mut events = Vec::new();
        if let Some(kind) = verdict.event_kind() {
            events.push(self.ctx.events.append(kind, self.payload(verdict, &reply)));
        }
        Ok(Outcome::Completed { events })
    }
}
