/// Wall-clock seconds since the epoch. All protocol timestamps (nick TS,
/// channel TS, topic TS) use this clock.
pub fn now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
