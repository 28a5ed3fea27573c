//! Payloads for the ClanForge queues.
//!
//! Field names are camelCase on the wire so jobs enqueued by the web app
//! decode unchanged.

use forge_queue::JobPayload;
use serde::{Deserialize, Serialize};

/// Transcode and analyse an uploaded VOD.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VodProcessingJob {
    pub vod_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organization_id: Option<String>,
    /// Location of the uploaded source file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// Output renditions, e.g. `["1080p", "720p"]`. Empty means the
    /// processor's defaults.
    #[serde(default)]
    pub qualities: Vec<String>,
}

impl JobPayload for VodProcessingJob {
    const QUEUE: &'static str = "vod-processing";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationJob {
    /// Notification kind, e.g. `match_scheduled`.
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl JobPayload for NotificationJob {
    const QUEUE: &'static str = "notifications";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailJob {
    pub to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl JobPayload for EmailJob {
    const QUEUE: &'static str = "emails";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscordJob {
    /// Integration action, e.g. `announce_match`.
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guild_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<String>,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl JobPayload for DiscordJob {
    const QUEUE: &'static str = "discord-integration";
}
