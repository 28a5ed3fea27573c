//! Collaborator services the queues delegate to.
//!
//! Each queue handler calls exactly one service. The logging
//! implementations validate the payload and record the delivery; swap in a
//! real implementation through [`Services`].

use async_trait::async_trait;
use forge_queue::JobError;
use std::sync::Arc;
use thiserror::Error;

use crate::jobs::{DiscordJob, EmailJob, NotificationJob, VodProcessingJob};

#[derive(Debug, Error)]
pub enum ServiceError {
    /// The payload cannot be acted on; retrying will not help.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The downstream service is temporarily unavailable.
    #[error("service unavailable: {0}")]
    Unavailable(String),
}

impl ServiceError {
    /// Convert into a job failure, retryable unless the input is invalid.
    pub fn into_job_error(self) -> JobError {
        match self {
            ServiceError::InvalidInput(_) => JobError::fatal(self.to_string()),
            ServiceError::Unavailable(_) => JobError::retryable(self.to_string()),
        }
    }
}

pub type ServiceResult = Result<(), ServiceError>;

#[async_trait]
pub trait VodProcessor: Send + Sync {
    async fn process_vod(&self, job: &VodProcessingJob) -> ServiceResult;
}

#[async_trait]
pub trait NotificationService: Send + Sync {
    async fn send_notification(&self, job: &NotificationJob) -> ServiceResult;
}

#[async_trait]
pub trait EmailService: Send + Sync {
    async fn send_email(&self, job: &EmailJob) -> ServiceResult;
}

#[async_trait]
pub trait DiscordService: Send + Sync {
    async fn process_action(&self, job: &DiscordJob) -> ServiceResult;
}

/// The set of services the worker's queues delegate to.
#[derive(Clone)]
pub struct Services {
    pub vod: Arc<dyn VodProcessor>,
    pub notifications: Arc<dyn NotificationService>,
    pub email: Arc<dyn EmailService>,
    pub discord: Arc<dyn DiscordService>,
}

impl Services {
    /// Services that validate and log each delivery.
    pub fn logging() -> Self {
        Self {
            vod: Arc::new(LoggingVodProcessor),
            notifications: Arc::new(LoggingNotificationService),
            email: Arc::new(LoggingEmailService),
            discord: Arc::new(LoggingDiscordService),
        }
    }
}

fn require(field: &str, value: &str) -> ServiceResult {
    if value.trim().is_empty() {
        return Err(ServiceError::InvalidInput(format!("{} must not be empty", field)));
    }
    Ok(())
}

pub struct LoggingVodProcessor;

#[async_trait]
impl VodProcessor for LoggingVodProcessor {
    async fn process_vod(&self, job: &VodProcessingJob) -> ServiceResult {
        require("vodId", &job.vod_id)?;
        tracing::debug!(
            vod_id = %job.vod_id,
            organization_id = ?job.organization_id,
            qualities = ?job.qualities,
            "VOD handed to processor"
        );
        Ok(())
    }
}

pub struct LoggingNotificationService;

#[async_trait]
impl NotificationService for LoggingNotificationService {
    async fn send_notification(&self, job: &NotificationJob) -> ServiceResult {
        require("type", &job.kind)?;
        tracing::debug!(kind = %job.kind, user_id = ?job.user_id, "Notification delivered");
        Ok(())
    }
}

pub struct LoggingEmailService;

#[async_trait]
impl EmailService for LoggingEmailService {
    async fn send_email(&self, job: &EmailJob) -> ServiceResult {
        require("to", &job.to)?;
        if !job.to.contains('@') {
            return Err(ServiceError::InvalidInput(format!(
                "not an email address: {}",
                job.to
            )));
        }
        tracing::debug!(to = %job.to, template = ?job.template, "Email delivered");
        Ok(())
    }
}

pub struct LoggingDiscordService;

#[async_trait]
impl DiscordService for LoggingDiscordService {
    async fn process_action(&self, job: &DiscordJob) -> ServiceResult {
        require("action", &job.action)?;
        tracing::debug!(action = %job.action, guild_id = ?job.guild_id, "Discord action performed");
        Ok(())
    }
}
