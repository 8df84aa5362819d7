//! Plattform-Eigenheiten beim Medienzugriff
//!
//! Welche Variante gilt, entscheidet die Host-Anwendung. Der Kern
//! schaut nie selbst in Umgebungs-Strings.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Berechtigungsmodell der Host-Plattform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PlatformQuirks {
    /// Übliches Modell: Berechtigung wird über den Standard-Dialog erteilt
    #[default]
    Standard,
    /// Strengeres Modell mit Berechtigungen pro Website, die nach einer
    /// Ablehnung nur in den Einstellungen zurückgesetzt werden können
    StrictPermissions,
    /// Eingebettete WebView; Berechtigungen verwaltet die umgebende App
    EmbeddedWebView,
}

impl PlatformQuirks {
    /// Hinweistext, wenn Kamera/Mikrofon verweigert wurden
    pub fn permission_guidance(self) -> &'static str {
        match self {
            PlatformQuirks::Standard => {
                "Camera or microphone access was blocked. Click the camera icon in the \
                 address bar, allow access, and rejoin the call."
            }
            PlatformQuirks::StrictPermissions => {
                "Camera or microphone access was blocked. Open the website settings for \
                 this page, set Camera and Microphone to \"Allow\", then reload and rejoin."
            }
            PlatformQuirks::EmbeddedWebView => {
                "Camera or microphone access was blocked. Enable camera and microphone \
                 permissions for this app in the system settings, then rejoin."
            }
        }
    }

    /// Hinweistext, wenn die Bildschirmfreigabe verweigert wurde
    pub fn screen_share_guidance(self) -> &'static str {
        match self {
            PlatformQuirks::Standard | PlatformQuirks::EmbeddedWebView => {
                "Screen sharing was cancelled or blocked. Try again and pick a screen or window."
            }
            PlatformQuirks::StrictPermissions => {
                "Screen sharing was blocked. Allow screen recording for this application in \
                 the system privacy settings, then try again."
            }
        }
    }

    /// Weicht der Berechtigungsablauf vom Standard ab?
    pub fn has_custom_permission_flow(self) -> bool {
        self != PlatformQuirks::Standard
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PlatformQuirks::Standard => "standard",
            PlatformQuirks::StrictPermissions => "strict-permissions",
            PlatformQuirks::EmbeddedWebView => "embedded-web-view",
        }
    }
}

impl FromStr for PlatformQuirks {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "standard" => Ok(PlatformQuirks::Standard),
            "strict-permissions" | "strict_permissions" => Ok(PlatformQuirks::StrictPermissions),
            "embedded-web-view" | "embedded_web_view" | "webview" => {
                Ok(PlatformQuirks::EmbeddedWebView)
            }
            other => Err(format!("unknown platform: {}", other)),
        }
    }
}

impl std::fmt::Display for PlatformQuirks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guidance_differs_per_platform() {
        let standard = PlatformQuirks::Standard.permission_guidance();
        let strict = PlatformQuirks::StrictPermissions.permission_guidance();
        assert_ne!(standard, strict);
        assert!(!PlatformQuirks::Standard.has_custom_permission_flow());
        assert!(PlatformQuirks::StrictPermissions.has_custom_permission_flow());
    }

    #[test]
    fn test_parse_round_trips_display() {
        for quirks in [
            PlatformQuirks::Standard,
            PlatformQuirks::StrictPermissions,
            PlatformQuirks::EmbeddedWebView,
        ] {
            assert_eq!(quirks.to_string().parse::<PlatformQuirks>(), Ok(quirks));
        }
        assert!("netscape".parse::<PlatformQuirks>().is_err());
    }
}
