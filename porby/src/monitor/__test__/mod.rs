#[cfg(test)]
mod __test__ {

  use crate::monitor::NetworkPathMonitor;

  #[test]
  fn test_monitor_starts_and_stops_cleanly() {
    let monitor = NetworkPathMonitor::start(|_| {});
    monitor.stop();
  }
}
