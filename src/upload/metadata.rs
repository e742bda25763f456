use std::fmt;
use std::path::Path;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

/// Longest title the hosting service accepts, in characters.
pub const MAX_TITLE_CHARS: usize = 100;

/// Format used for the `{timestamp}` placeholder.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Who can see an uploaded video.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Public,
    #[default]
    Unlisted,
    Private,
}

impl Visibility {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Public => "public",
            Self::Unlisted => "unlisted",
            Self::Private => "private",
        }
    }
}

impl fmt::Display for Visibility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operator-chosen rules for describing every upload.
#[derive(Debug, Clone)]
pub struct MetadataPolicy {
    pub title_template: String,
    pub description: String,
    pub visibility: Visibility,
}

/// Title, description and visibility for one upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadMetadata {
    pub title: String,
    pub description: String,
    pub visibility: Visibility,
}

impl UploadMetadata {
    /// Render the policy for a file detected at `detected_at`.
    pub fn from_policy(policy: &MetadataPolicy, path: &Path, detected_at: DateTime<Local>) -> Self {
        let file_name = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_default();
        let timestamp = detected_at.format(TIMESTAMP_FORMAT).to_string();

        let rendered = policy
            .title_template
            .replace("{timestamp}", &timestamp)
            .replace("{file_name}", &file_name);

        Self {
            title: sanitize_title(&rendered),
            description: policy.description.clone(),
            visibility: policy.visibility,
        }
    }
}

/// Drop characters the service refuses in titles and clamp the length.
fn sanitize_title(raw: &str) -> String {
    raw.chars()
        .filter(|c| *c != '<' && *c != '>')
        .take(MAX_TITLE_CHARS)
        .collect::<String>()
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn policy(template: &str) -> MetadataPolicy {
        MetadataPolicy {
            title_template: template.to_string(),
            description: "Automatically uploaded".to_string(),
            visibility: Visibility::Unlisted,
        }
    }

    fn detected() -> DateTime<Local> {
        Local.with_ymd_and_hms(2020, 1, 14, 19, 46, 35).unwrap()
    }

    #[test]
    fn test_title_embeds_detection_timestamp() {
        let meta = UploadMetadata::from_policy(
            &policy("Dota Replay {timestamp}"),
            Path::new("/rec/clip.mp4"),
            detected(),
        );
        assert_eq!(meta.title, "Dota Replay 2020-01-14 19:46:35");
        assert_eq!(meta.description, "Automatically uploaded");
        assert_eq!(meta.visibility, Visibility::Unlisted);
    }

    #[test]
    fn test_title_can_use_file_stem() {
        let meta = UploadMetadata::from_policy(
            &policy("{file_name} ({timestamp})"),
            Path::new("/rec/ranked-match.mkv"),
            detected(),
        );
        assert_eq!(meta.title, "ranked-match (2020-01-14 19:46:35)");
    }

    #[test]
    fn test_title_strips_angle_brackets_and_truncates() {
        let long = format!("<b>{}</b>", "x".repeat(150));
        let meta = UploadMetadata::from_policy(&policy(&long), Path::new("a.mp4"), detected());
        assert!(!meta.title.contains('<'));
        assert!(!meta.title.contains('>'));
        assert_eq!(meta.title.chars().count(), MAX_TITLE_CHARS);
    }

    #[test]
    fn test_visibility_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&Visibility::Private).unwrap(),
            "\"private\""
        );
        assert_eq!(Visibility::default().to_string(), "unlisted");
    }
}
