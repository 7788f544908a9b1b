//! Camera role detection strategies

use super::{CameraDevice, FacingMode};

/// Decides which way a device faces.
///
/// Platforms without a reliable facing API fall back to label matching
/// ([`LabelHeuristic`]); a platform-correct implementation can be swapped in
/// without touching [`super::CameraManager`].
pub trait CameraRoleClassifier: Send + Sync {
    fn facing(&self, device: &CameraDevice) -> Option<FacingMode>;
}

/// Keyword match on the device label. Case-insensitive.
#[derive(Debug, Clone)]
pub struct LabelHeuristic {
    front_keywords: Vec<String>,
    back_keywords: Vec<String>,
}

impl Default for LabelHeuristic {
    fn default() -> Self {
        Self::new(
            ["front", "user", "facetime", "selfie"],
            ["back", "rear", "environment", "world"],
        )
    }
}

impl LabelHeuristic {
    pub fn new<F, B, S>(front: F, back: B) -> Self
    where
        F: IntoIterator<Item = S>,
        B: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            front_keywords: front.into_iter().map(|s| s.as_ref().to_lowercase()).collect(),
            back_keywords: back.into_iter().map(|s| s.as_ref().to_lowercase()).collect(),
        }
    }
}

impl CameraRoleClassifier for LabelHeuristic {
    fn facing(&self, device: &CameraDevice) -> Option<FacingMode> {
        let label = device.label.to_lowercase();
        let front = self.front_keywords.iter().any(|k| label.contains(k.as_str()));
        let back = self.back_keywords.iter().any(|k| label.contains(k.as_str()));
        match (front, back) {
            (true, false) => Some(FacingMode::User),
            (false, true) => Some(FacingMode::Environment),
            // ambiguous or unknown
            _ => None,
        }
    }
}

/// First device classified as `mode`, in enumeration order.
pub fn pick<'a>(
    classifier: &dyn CameraRoleClassifier,
    devices: &'a [CameraDevice],
    mode: FacingMode,
) -> Option<&'a CameraDevice> {
    devices
        .iter()
        .find(|device| classifier.facing(device) == Some(mode))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_label_heuristic_classifies_common_labels() {
        let h = LabelHeuristic::default();
        let front = CameraDevice::video("a", "FaceTime HD Camera");
        let back = CameraDevice::video("b", "Back Dual Wide Camera");
        let rear = CameraDevice::video("c", "camera2 0, facing back");
        let plain = CameraDevice::video("d", "USB2.0 HD UVC WebCam");
        assert_eq!(h.facing(&front), Some(FacingMode::User));
        assert_eq!(h.facing(&back), Some(FacingMode::Environment));
        assert_eq!(h.facing(&rear), Some(FacingMode::Environment));
        assert_eq!(h.facing(&plain), None);
    }

    #[test]
    fn test_ambiguous_label_is_unclassified() {
        let h = LabelHeuristic::default();
        let both = CameraDevice::video("x", "Front/Back switchable");
        assert_eq!(h.facing(&both), None);
    }

    #[test]
    fn test_pick_respects_enumeration_order() {
        let h = LabelHeuristic::default();
        let devices = vec![
            CameraDevice::video("1", "Rear Camera"),
            CameraDevice::video("2", "Front Camera"),
            CameraDevice::video("3", "Rear Telephoto"),
        ];
        assert_eq!(pick(&h, &devices, FacingMode::Environment).unwrap().id, "1");
        assert_eq!(pick(&h, &devices, FacingMode::User).unwrap().id, "2");
        assert!(pick(&h, &[], FacingMode::User).is_none());
    }

    #[test]
    fn test_custom_keywords() {
        let h = LabelHeuristic::new(["inner"], ["outer"]);
        assert_eq!(
            h.facing(&CameraDevice::video("i", "Inner lens")),
            Some(FacingMode::User)
        );
        assert_eq!(h.facing(&CameraDevice::video("f", "Front Camera")), None);
    }
}
