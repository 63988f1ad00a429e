use fleet_plan::{render_summary, Level, PlanApi};

pub fn gs(api: &PlanApi, role: &str, level: Level) -> anyhow::Result<String> {
    let details = api.status(role)?;
    match level {
        Level::Summary => {
            let rows: Vec<_> = details.into_iter().map(|d| d.status).collect();
            Ok(render_summary(&rows))
        }
        Level::Detail => Ok(serde_json::to_string_pretty(&details)? + "\n"),
    }
}
