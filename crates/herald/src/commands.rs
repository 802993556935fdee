//! One-shot CLI commands against the file-backed stores.

use chrono::{DateTime, Utc};
use herald_scheduler::{JobId, JobView, NewPost, Payload, Platform, Scheduler, Timeline};
use miette::{IntoDiagnostic, Result};

/// Arguments of `herald schedule`.
pub struct ScheduleArgs {
    pub owner: String,
    pub title: String,
    pub text: String,
    pub link: Option<String>,
    pub tags: Vec<String>,
    pub platforms: Vec<Platform>,
    pub at: Option<DateTime<Utc>>,
}

pub async fn schedule(scheduler: &Scheduler, args: ScheduleArgs) -> Result<()> {
    let job = scheduler
        .schedule_post(NewPost {
            owner_id: args.owner,
            title: args.title,
            payload: Payload {
                text: args.text,
                link: args.link,
                media: Vec::new(),
                tags: args.tags,
            },
            scheduled_time: args.at.unwrap_or_else(Utc::now),
            platforms: args.platforms,
        })
        .await
        .map_err(|e| miette::miette!("{}", e))?;

    println!("{}", job.id);
    Ok(())
}

pub async fn cancel(scheduler: &Scheduler, id: JobId) -> Result<()> {
    let job = scheduler
        .cancel_job(id)
        .await
        .map_err(|e| miette::miette!("{}", e))?;
    println!("{} {}", job.id, job.status);
    Ok(())
}

pub async fn list(scheduler: &Scheduler, owner: Option<&str>, json: bool) -> Result<()> {
    let jobs = scheduler
        .list_jobs(owner)
        .await
        .map_err(|e| miette::miette!("{}", e))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&jobs).into_diagnostic()?);
    } else {
        for job in &jobs {
            println!("{}", summary_line(job));
        }
    }
    Ok(())
}

pub async fn show(scheduler: &Scheduler, id: JobId, json: bool) -> Result<()> {
    let view = scheduler
        .job_view(id)
        .await
        .map_err(|e| miette::miette!("{}", e))?;
    let timeline = scheduler
        .timeline(id)
        .await
        .map_err(|e| miette::miette!("{}", e))?;

    if json {
        let out = serde_json::json!({ "job": view, "timeline": timeline });
        println!("{}", serde_json::to_string_pretty(&out).into_diagnostic()?);
    } else {
        print!("{}", render_job(&view, &timeline));
    }
    Ok(())
}

/// Make retryable targets due now, optionally dispatching in this process.
pub async fn retry(scheduler: &Scheduler, id: JobId, dispatch: bool) -> Result<()> {
    let rescheduled = scheduler
        .retry_now(id)
        .await
        .map_err(|e| miette::miette!("{}", e))?;
    println!("{rescheduled} target(s) due now");

    if dispatch && rescheduled > 0 {
        let report = scheduler
            .dispatch_now(id)
            .await
            .map_err(|e| miette::miette!("{}", e))?;
        println!("{} {}", report.job_id, report.status);
    }
    Ok(())
}

fn summary_line(job: &JobView) -> String {
    let platforms: Vec<String> = job
        .targets
        .iter()
        .map(|t| format!("{}:{}", t.platform, t.state))
        .collect();
    let status = if job.partial {
        format!("{} (partial)", job.status)
    } else {
        job.status.to_string()
    };
    format!(
        "{}  {}  {:<20}  {}  {}",
        job.id,
        job.scheduled_time.format("%Y-%m-%d %H:%M"),
        status,
        job.title,
        platforms.join(" ")
    )
}

fn render_job(view: &JobView, timeline: &Timeline) -> String {
    let mut out = String::new();
    out.push_str(&format!("{}  {}\n", view.id, view.title));
    out.push_str(&format!("owner:     {}\n", view.owner_id));
    out.push_str(&format!("scheduled: {}\n", view.scheduled_time.to_rfc3339()));
    out.push_str(&format!(
        "status:    {}{}\n",
        view.status,
        if view.partial { " (partial)" } else { "" }
    ));

    out.push_str("targets:\n");
    for target in &view.targets {
        out.push_str(&format!(
            "  {:<10} {:<17} attempts={}",
            target.platform.to_string(),
            target.state.to_string(),
            target.attempt_count
        ));
        if let Some(external_ref) = &target.external_ref {
            out.push_str(&format!(
                "  {}",
                external_ref.url.as_deref().unwrap_or(&external_ref.id)
            ));
        }
        if let Some(next) = target.next_attempt_at {
            out.push_str(&format!("  next={}", next.to_rfc3339()));
        }
        if let Some(reason) = &target.failure_reason {
            out.push_str(&format!("  ({reason})"));
        }
        out.push('\n');
    }

    let counts = timeline.counts;
    out.push_str(&format!(
        "timeline:  {} started, {} succeeded, {} failed\n",
        counts.started, counts.succeeded, counts.failed
    ));
    for entry in &timeline.entries {
        out.push_str(&format!(
            "  {}  {:<10} #{} {:?}  {}\n",
            entry.timestamp.format("%Y-%m-%d %H:%M:%S"),
            entry.platform.to_string(),
            entry.attempt,
            entry.status,
            entry.message
        ));
    }
    out
}
