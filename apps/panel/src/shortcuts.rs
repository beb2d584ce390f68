use std::collections::{HashMap, HashSet};

pub const DEFAULT_SHORTCUTS: &[(&str, &str)] = &[
    ("w", "forward"),
    ("s", "backward"),
    ("a", "left"),
    ("d", "right"),
    ("q", "DS"),
    ("e", "TS"),
    ("ArrowUp", "up"),
    ("ArrowDown", "down"),
    ("ArrowLeft", "lookleft"),
    ("ArrowRight", "lookright"),
    ("1", "jump"),
    ("2", "handshake"),
    ("3", "steady"),
    ("4", "bolliOs"),
    ("f", "faceDetection"),
    ("o", "objectRecognition"),
    ("g", "gestureRecognition"),
    ("m", "motionTracking"),
    ("c", "findColor"),
    ("l", "trackLine"),
    ("Escape", "emergencyStop"),
    ("r", "resetPosition"),
    ("p", "takePhoto"),
    ("v", "recordVideo"),
    ("h", "toggleHelp"),
    ("F1", "showHelp"),
];

const CV_MODES: &[&str] = &[
    "faceDetection",
    "objectRecognition",
    "gestureRecognition",
    "motionTracking",
    "findColor",
    "trackLine",
];

const EMERGENCY_STOP: &[&str] = &[
    "DS",
    "TS",
    "UDstop",
    "LRstop",
    "faceDetectionOff",
    "motionTrackingOff",
];

fn stop_for(action: &str) -> Option<&'static str> {
    match action {
        "forward" | "backward" => Some("DS"),
        "left" | "right" => Some("TS"),
        "up" | "down" => Some("UDstop"),
        "lookleft" | "lookright" => Some("LRstop"),
        _ => None,
    }
}

/// Translates key presses and releases into command tokens.
///
/// Tracks which keys are held so auto-repeat is ignored, and keeps the local
/// on/off state used by the toggling actions.
#[derive(Debug)]
pub struct KeyboardDispatcher {
    bindings: HashMap<String, String>,
    held: HashSet<String>,
    active_modes: HashSet<&'static str>,
    recording: bool,
}

impl Default for KeyboardDispatcher {
    fn default() -> Self {
        Self::new(DEFAULT_SHORTCUTS)
    }
}

impl KeyboardDispatcher {
    pub fn new(table: &[(&str, &str)]) -> Self {
        Self {
            bindings: table
                .iter()
                .map(|(key, action)| (key.to_string(), action.to_string()))
                .collect(),
            held: HashSet::new(),
            active_modes: HashSet::new(),
            recording: false,
        }
    }

    /// The bound key `key` resolves to; letter keys arrive uppercase while
    /// shift or caps lock is on.
    fn bound_key(&self, key: &str) -> Option<String> {
        if self.bindings.contains_key(key) {
            return Some(key.to_string());
        }
        let mut chars = key.chars();
        match (chars.next(), chars.next()) {
            (Some(c), None) => {
                let lower = c.to_lowercase().to_string();
                self.bindings.contains_key(&lower).then_some(lower)
            }
            _ => None,
        }
    }

    pub fn action_for(&self, key: &str) -> Option<&str> {
        self.bound_key(key)
            .and_then(|bound| self.bindings.get(&bound))
            .map(String::as_str)
    }

    pub fn is_mode_active(&self, mode: &str) -> bool {
        self.active_modes.contains(mode)
    }

    pub fn is_recording(&self) -> bool {
        self.recording
    }

    pub fn press(&mut self, key: &str) -> Vec<String> {
        let Some(bound) = self.bound_key(key) else {
            return Vec::new();
        };
        let Some(action) = self.bindings.get(&bound).cloned() else {
            return Vec::new();
        };
        if !self.held.insert(bound) {
            return Vec::new();
        }

        if let Some(mode) = CV_MODES.iter().copied().find(|mode| *mode == action) {
            return if self.active_modes.remove(mode) {
                vec![format!("{mode}Off")]
            } else {
                self.active_modes.insert(mode);
                vec![mode.to_string()]
            };
        }

        match action.as_str() {
            "emergencyStop" => {
                self.active_modes.remove("faceDetection");
                self.active_modes.remove("motionTracking");
                EMERGENCY_STOP.iter().map(|c| c.to_string()).collect()
            }
            "recordVideo" => {
                self.recording = !self.recording;
                let command = if self.recording {
                    "startRecording"
                } else {
                    "stopRecording"
                };
                vec![command.to_string()]
            }
            "toggleHelp" | "showHelp" => Vec::new(),
            _ => vec![action],
        }
    }

    pub fn release(&mut self, key: &str) -> Vec<String> {
        let Some(bound) = self.bound_key(key) else {
            return Vec::new();
        };
        if !self.held.remove(&bound) {
            return Vec::new();
        }
        self.bindings
            .get(&bound)
            .and_then(|action| stop_for(action))
            .map(|stop| vec![stop.to_string()])
            .unwrap_or_default()
    }

    pub fn bindings(&self) -> Vec<(&str, &str)> {
        let mut bindings: Vec<_> = self
            .bindings
            .iter()
            .map(|(key, action)| (key.as_str(), action.as_str()))
            .collect();
        bindings.sort();
        bindings
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn movement_keys_send_on_press_and_stop_on_release() {
        let mut keys = KeyboardDispatcher::default();
        assert_eq!(keys.press("w"), vec!["forward"]);
        assert_eq!(keys.release("w"), vec!["DS"]);
        assert_eq!(keys.press("d"), vec!["right"]);
        assert_eq!(keys.release("d"), vec!["TS"]);
        assert_eq!(keys.press("ArrowUp"), vec!["up"]);
        assert_eq!(keys.release("ArrowUp"), vec!["UDstop"]);
        assert_eq!(keys.press("ArrowLeft"), vec!["lookleft"]);
        assert_eq!(keys.release("ArrowLeft"), vec!["LRstop"]);
    }

    #[test]
    fn held_key_repeat_is_ignored() {
        let mut keys = KeyboardDispatcher::default();
        assert_eq!(keys.press("s"), vec!["backward"]);
        assert!(keys.press("s").is_empty());
        assert!(keys.press("s").is_empty());
        assert_eq!(keys.release("s"), vec!["DS"]);
        assert!(keys.release("s").is_empty());
        assert_eq!(keys.press("s"), vec!["backward"]);
    }

    #[test]
    fn shifted_press_is_stopped_by_plain_release() {
        let mut keys = KeyboardDispatcher::default();
        assert_eq!(keys.press("W"), vec!["forward"]);
        assert!(keys.press("w").is_empty());
        assert_eq!(keys.release("w"), vec!["DS"]);

        assert_eq!(keys.press("a"), vec!["left"]);
        assert_eq!(keys.release("A"), vec!["TS"]);
        assert!(keys.release("a").is_empty());
    }

    #[test]
    fn cv_modes_toggle_between_on_and_off() {
        let mut keys = KeyboardDispatcher::default();
        assert_eq!(keys.press("c"), vec!["findColor"]);
        assert!(keys.release("c").is_empty());
        assert!(keys.is_mode_active("findColor"));
        assert_eq!(keys.press("c"), vec!["findColorOff"]);
        assert!(!keys.is_mode_active("findColor"));
    }

    #[test]
    fn emergency_stop_halts_everything_and_clears_tracking() {
        let mut keys = KeyboardDispatcher::default();
        keys.press("m");
        keys.release("m");
        assert!(keys.is_mode_active("motionTracking"));

        assert_eq!(
            keys.press("Escape"),
            vec![
                "DS",
                "TS",
                "UDstop",
                "LRstop",
                "faceDetectionOff",
                "motionTrackingOff"
            ]
        );
        assert!(!keys.is_mode_active("motionTracking"));
    }

    #[test]
    fn record_video_alternates_start_and_stop() {
        let mut keys = KeyboardDispatcher::default();
        assert_eq!(keys.press("v"), vec!["startRecording"]);
        keys.release("v");
        assert!(keys.is_recording());
        assert_eq!(keys.press("v"), vec!["stopRecording"]);
    }

    #[test]
    fn help_and_unbound_keys_send_nothing() {
        let mut keys = KeyboardDispatcher::default();
        assert!(keys.press("h").is_empty());
        assert!(keys.press("F1").is_empty());
        assert!(keys.press("z").is_empty());
        assert!(keys.release("z").is_empty());
    }

    #[test]
    fn other_actions_are_sent_verbatim_and_shift_is_ignored() {
        let mut keys = KeyboardDispatcher::default();
        assert_eq!(keys.press("4"), vec!["bolliOs"]);
        assert_eq!(keys.press("P"), vec!["takePhoto"]);
        assert_eq!(keys.press("r"), vec!["resetPosition"]);
        assert_eq!(keys.press("q"), vec!["DS"]);
        assert!(keys.release("q").is_empty());
    }
}
