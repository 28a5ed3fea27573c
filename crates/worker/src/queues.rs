//! The ClanForge queues and their handlers.

use forge_queue::{Backend, JobResult, QueueSpec, WorkerProcess};

use crate::jobs::{DiscordJob, EmailJob, NotificationJob, VodProcessingJob};
use crate::services::{ServiceResult, Services};

pub const VOD_PROCESSING_CONCURRENCY: usize = 2;
pub const NOTIFICATIONS_CONCURRENCY: usize = 5;
pub const EMAILS_CONCURRENCY: usize = 3;
pub const DISCORD_CONCURRENCY: usize = 2;

/// Declare every queue on `worker`, each delegating to one of `services`.
pub fn declare<B: Backend + Clone + 'static>(
    worker: WorkerProcess<B>,
    services: Services,
) -> WorkerProcess<B> {
    worker
        .queue(vod_processing(&services))
        .queue(notifications(&services))
        .queue(emails(&services))
        .queue(discord_integration(&services))
}

fn vod_processing(services: &Services) -> QueueSpec {
    let processor = services.vod.clone();
    QueueSpec::typed::<VodProcessingJob, _, _>(VOD_PROCESSING_CONCURRENCY, move |job| {
        let processor = processor.clone();
        async move {
            tracing::info!("Processing VOD: {}", job.vod_id);
            let result = processor.process_vod(&job).await;
            finish(result, "VOD processing", &job.vod_id)
        }
    })
}

fn notifications(services: &Services) -> QueueSpec {
    let notifier = services.notifications.clone();
    QueueSpec::typed::<NotificationJob, _, _>(NOTIFICATIONS_CONCURRENCY, move |job| {
        let notifier = notifier.clone();
        async move {
            tracing::info!("Sending notification: {}", job.kind);
            let result = notifier.send_notification(&job).await;
            finish(result, "Notification", &job.kind)
        }
    })
}

fn emails(services: &Services) -> QueueSpec {
    let mailer = services.email.clone();
    QueueSpec::typed::<EmailJob, _, _>(EMAILS_CONCURRENCY, move |job| {
        let mailer = mailer.clone();
        async move {
            tracing::info!("Sending email: {}", job.to);
            let result = mailer.send_email(&job).await;
            finish(result, "Email", &job.to)
        }
    })
}

fn discord_integration(services: &Services) -> QueueSpec {
    let discord = services.discord.clone();
    QueueSpec::typed::<DiscordJob, _, _>(DISCORD_CONCURRENCY, move |job| {
        let discord = discord.clone();
        async move {
            tracing::info!("Processing Discord action: {}", job.action);
            let result = discord.process_action(&job).await;
            finish(result, "Discord action", &job.action)
        }
    })
}

/// Log the outcome of a service call and turn it into a job result.
fn finish(result: ServiceResult, what: &str, subject: &str) -> JobResult {
    match result {
        Ok(()) => {
            tracing::info!("{} completed: {}", what, subject);
            Ok(())
        }
        Err(e) => {
            tracing::error!(error = %e, "{} failed: {}", what, subject);
            Err(e.into_job_error())
        }
    }
}
