use common::{CompletionMessage, Job, JobStatus};

/// Message body for `/job-finish`. Only terminal statuses are rendered.
pub fn render(job: &Job, status: JobStatus, site_base_url: &str) -> Option<CompletionMessage> {
    let name = job.kind.display_name();
    let link = format!(
        "{}/api/v1/jobs/{}/results",
        site_base_url.trim_end_matches('/'),
        job.id
    );

    let (text, html) = match status {
        JobStatus::Complete => (
            format!(
                "Your {name} ({id}) has finished.\n\nYou can download the results here:\n{link}\n",
                id = job.id
            ),
            format!(
                "<p>Your {name} (<code>{id}</code>) has finished.</p>\
                 <p><a href=\"{link}\">Download the results</a></p>",
                name = escape(name),
                id = escape(&job.id),
                link = escape(&link)
            ),
        ),
        JobStatus::Error => {
            let reason = job.error.as_deref().unwrap_or("unknown error");
            (
                format!(
                    "Your {name} ({id}) failed.\n\nError: {reason}\n\nPlease check your input and submit the job again.\n",
                    id = job.id
                ),
                format!(
                    "<p>Your {name} (<code>{id}</code>) failed.</p>\
                     <p>Error: <code>{reason}</code></p>\
                     <p>Please check your input and submit the job again.</p>",
                    name = escape(name),
                    id = escape(&job.id),
                    reason = escape(reason)
                ),
            )
        }
        _ => return None,
    };
    Some(CompletionMessage { text, html })
}

fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}
