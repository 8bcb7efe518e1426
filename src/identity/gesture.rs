//! Attendance gesture rules.
//!
//! Landmarks use normalized image coordinates with y growing downward, in the
//! 21-point hand layout (wrist = 0, thumb 1..=4, index 5..=8, middle 9..=12,
//! ring 13..=16, pinky 17..=20). The rules only compare vertical positions.

use serde::Serialize;
use std::fmt;

use crate::perception::HandLandmarks;

pub const WRIST: usize = 0;
pub const THUMB_IP: usize = 3;
pub const THUMB_TIP: usize = 4;
pub const INDEX_MCP: usize = 5;
pub const INDEX_TIP: usize = 8;
pub const MIDDLE_MCP: usize = 9;
pub const MIDDLE_TIP: usize = 12;

#[derive(Clone, Copy, Debug, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Gesture {
    ThumbUp,
    ThumbDown,
    None,
}

impl Gesture {
    pub fn as_str(&self) -> &'static str {
        match self {
            Gesture::ThumbUp => "thumb_up",
            Gesture::ThumbDown => "thumb_down",
            Gesture::None => "none",
        }
    }

    /// Attendance action recorded for the gesture.
    pub fn action(&self) -> &'static str {
        match self {
            Gesture::ThumbUp => "Check In",
            _ => "Check Out",
        }
    }
}

impl fmt::Display for Gesture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classify one hand.
///
/// - thumb up: thumb tip above its IP joint and above the index knuckle, with
///   index and middle fingertips below their knuckles (folded)
/// - thumb down: thumb tip above its IP joint and below the wrist
pub fn classify_gesture(hand: &HandLandmarks) -> Gesture {
    let y = |idx: usize| hand.point(idx).map(|p| p.y);
    let (Some(thumb_tip), Some(thumb_ip), Some(wrist), Some(index_mcp), Some(index_tip), Some(middle_mcp), Some(middle_tip)) = (
        y(THUMB_TIP),
        y(THUMB_IP),
        y(WRIST),
        y(INDEX_MCP),
        y(INDEX_TIP),
        y(MIDDLE_MCP),
        y(MIDDLE_TIP),
    ) else {
        return Gesture::None;
    };

    let thumb_extended = thumb_tip < thumb_ip;
    let thumb_above_hand = thumb_tip < index_mcp;
    let index_folded = index_tip > index_mcp;
    let middle_folded = middle_tip > middle_mcp;

    if thumb_extended && thumb_above_hand && index_folded && middle_folded {
        Gesture::ThumbUp
    } else if thumb_extended && thumb_tip > wrist {
        Gesture::ThumbDown
    } else {
        Gesture::None
    }
}

/// Gesture of the first hand that yields one; later hands are ignored.
pub fn first_gesture(hands: &[HandLandmarks]) -> Gesture {
    hands
        .iter()
        .map(classify_gesture)
        .find(|g| *g != Gesture::None)
        .unwrap_or(Gesture::None)
}

#[cfg(test)]
pub(crate) mod fixtures {
    use crate::perception::{HandLandmarks, Landmark};

    fn hand_with(overrides: &[(usize, f32)]) -> HandLandmarks {
        let mut points = vec![Landmark { x: 0.5, y: 0.5, z: 0.0 }; 21];
        for (idx, y) in overrides {
            points[*idx].y = *y;
        }
        HandLandmarks::new(points)
    }

    pub fn thumb_up() -> HandLandmarks {
        hand_with(&[
            (super::WRIST, 0.9),
            (super::THUMB_IP, 0.4),
            (super::THUMB_TIP, 0.2),
            (super::INDEX_MCP, 0.5),
            (super::INDEX_TIP, 0.6),
            (super::MIDDLE_MCP, 0.5),
            (super::MIDDLE_TIP, 0.6),
        ])
    }

    pub fn thumb_down() -> HandLandmarks {
        // Raised wrist, thumb tip above its joint but below the wrist.
        hand_with(&[
            (super::WRIST, 0.3),
            (super::THUMB_IP, 0.8),
            (super::THUMB_TIP, 0.7),
            (super::INDEX_MCP, 0.4),
            (super::INDEX_TIP, 0.3),
            (super::MIDDLE_MCP, 0.4),
            (super::MIDDLE_TIP, 0.3),
        ])
    }

    pub fn open_palm() -> HandLandmarks {
        hand_with(&[
            (super::WRIST, 0.9),
            (super::THUMB_IP, 0.6),
            (super::THUMB_TIP, 0.65),
            (super::INDEX_MCP, 0.5),
            (super::INDEX_TIP, 0.2),
            (super::MIDDLE_MCP, 0.5),
            (super::MIDDLE_TIP, 0.15),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;
    use crate::perception::Landmark;

    #[test]
    fn classifies_thumb_up() {
        assert_eq!(classify_gesture(&thumb_up()), Gesture::ThumbUp);
    }

    #[test]
    fn classifies_thumb_down() {
        assert_eq!(classify_gesture(&thumb_down()), Gesture::ThumbDown);
    }

    #[test]
    fn open_palm_is_no_gesture() {
        assert_eq!(classify_gesture(&open_palm()), Gesture::None);
    }

    #[test]
    fn thumb_up_requires_folded_fingers() {
        let mut hand = thumb_up();
        hand.set_y(INDEX_TIP, 0.1);
        assert_eq!(classify_gesture(&hand), Gesture::None);
    }

    #[test]
    fn truncated_landmark_set_is_no_gesture() {
        let hand = HandLandmarks::new(vec![Landmark { x: 0.0, y: 0.0, z: 0.0 }; 4]);
        assert_eq!(classify_gesture(&hand), Gesture::None);
    }

    #[test]
    fn first_non_none_hand_wins() {
        let hands = vec![open_palm(), thumb_down(), thumb_up()];
        assert_eq!(first_gesture(&hands), Gesture::ThumbDown);
        assert_eq!(first_gesture(&[open_palm()]), Gesture::None);
        assert_eq!(first_gesture(&[]), Gesture::None);
    }
}
