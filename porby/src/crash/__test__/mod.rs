#[cfg(test)]
mod __test__ {

  use std::process::Command;
  use std::time::Duration;

  use tempfile::TempDir;

  use crate::config::Config;
  use crate::crash::{capture_frames, install, uninstall};
  use crate::engine::LogEngine;
  use crate::event::{LogExtra, LogLevel};

  #[test]
  fn test_capture_frames_resolves_something() {
    let frames = capture_frames();
    assert!(!frames.is_empty());
    assert!(frames.len() <= 64);
    // at least one frame should carry a resolved symbol on a debug build
    assert!(frames.iter().any(|f| !f.symbol.is_empty()));
  }

  #[test]
  fn test_panic_hook_journals_a_fatal_crash_entry() {
    let dir = TempDir::new().unwrap();
    let mut config = Config::default();
    config.transport.port = 0;
    config.transport.requires_pairing = false;
    config.persistence.directory_override = Some(dir.path().to_path_buf());
    config.collectors.performance = false;
    config.collectors.crash = false; // installed by hand below
    config.limits.flush_interval = Duration::from_secs(30);
    let engine = LogEngine::start(config);

    install(&engine);
    let caught = std::panic::catch_unwind(|| panic!("deliberate test panic"));
    assert!(caught.is_err());
    uninstall();

    // the hook drained synchronously into the journal before unwinding
    let journal = crate::journal::Journal::new(crate::config::PersistenceConfig {
      directory_override: Some(dir.path().to_path_buf()),
      ..Default::default()
    })
    .unwrap();
    let entries = journal.load_for_replay();
    let crash = entries
      .iter()
      .find(|e| e.level == LogLevel::Fatal)
      .expect("fatal crash entry journaled");
    assert!(crash.message.contains("deliberate test panic"));
    match &crash.extra {
      Some(LogExtra::Crash(info)) => {
        assert_eq!(info.exception_type.as_deref(), Some("panic"));
        assert!(!info.frames.is_empty());
      },
      other => panic!("expected crash extra, got {:?}", other),
    }

    engine.stop();
  }

  // Re-runs this same test binary as a child that raises SIGSEGV mid-run,
  // then checks two things from the parent: the exit status names the
  // original signal, and the emergency drain left a journal file behind.
  #[test]
  fn test_sigsegv_journals_then_reraises() {
    if let Ok(dir) = std::env::var("PORBY_CRASH_CHILD_DIR") {
      let mut config = Config::default();
      config.transport.port = 0;
      config.transport.requires_pairing = false;
      config.persistence.directory_override = Some(dir.into());
      config.collectors.performance = false;
      config.limits.flush_interval = Duration::from_secs(30);
      let engine = LogEngine::start(config);
      engine.submit(crate::event::LogEntry::new(
        LogLevel::Error,
        crate::event::Category::app(),
        "last words",
        "c.rs",
        "t",
        1,
      ));
      // give the writer thread a beat to land the entry in the buffer
      std::thread::sleep(Duration::from_millis(300));
      unsafe {
        libc::raise(libc::SIGSEGV);
      }
      unreachable!("the default handler should have killed us");
    }

    let dir = TempDir::new().unwrap();
    let exe = std::env::current_exe().unwrap();
    let status = Command::new(exe)
      .args([
        "crash::__test__::__test__::test_sigsegv_journals_then_reraises",
        "--exact",
        "--nocapture",
        "--test-threads=1",
      ])
      .env("PORBY_CRASH_CHILD_DIR", dir.path())
      .status()
      .unwrap();

    #[cfg(unix)]
    {
      use std::os::unix::process::ExitStatusExt;
      assert_eq!(status.signal(), Some(libc::SIGSEGV));
    }

    let journal = crate::journal::Journal::new(crate::config::PersistenceConfig {
      directory_override: Some(dir.path().to_path_buf()),
      ..Default::default()
    })
    .unwrap();
    let entries = journal.load_for_replay();
    assert!(
      entries.iter().any(|e| e.message == "last words"),
      "pre-crash entry missing from the journal"
    );
    assert!(
      entries
        .iter()
        .any(|e| matches!(&e.extra, Some(LogExtra::Crash(info)) if info.signal.as_deref() == Some("SIGSEGV"))),
      "crash entry missing from the journal"
    );
  }
}
