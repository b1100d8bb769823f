use chrono::{DateTime, Local};

pub fn get_version_info() -> &'static str {
    let version = env!("CARGO_PKG_VERSION");
    let build_time = env!("BUILD_TIME");
    let git_commit = env!("GIT_COMMIT_HASH");
    let git_dirty = env!("GIT_DIRTY");

    let build_timestamp: i64 = build_time.parse().unwrap_or(0);
    let build_datetime: DateTime<Local> = DateTime::from_timestamp(build_timestamp, 0)
        .map(|utc| utc.with_timezone(&Local))
        .unwrap_or_else(Local::now);

    Box::leak(
        format!(
            "supercall {}\nBuild Time: {}\nGit Commit: {} ({})",
            version,
            build_datetime.format("%Y-%m-%d %H:%M:%S %Z"),
            git_commit,
            git_dirty,
        )
        .into_boxed_str(),
    )
}
