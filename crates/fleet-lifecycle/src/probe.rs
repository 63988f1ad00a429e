//! Process table parsing.

/// Arguments for `ps` that print one `<pid> <args>` line per process.
pub const PS_ARGS: &str = "-eo pid=,args=";

/// Find the pid whose full command line equals `command_line`.
///
/// Matching is exact so that shells wrapping the command (whose own
/// command lines merely contain it) are never mistaken for the worker.
pub fn find_pid(process_table: &str, command_line: &str) -> Option<u32> {
    let wanted = command_line.trim();
    process_table.lines().find_map(|line| {
        let (pid, args) = line.trim().split_once(char::is_whitespace)?;
        if args.trim() == wanted {
            pid.parse().ok()
        } else {
            None
        }
    })
}
