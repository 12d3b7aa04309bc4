//! Failed destination setups must not leave descriptors behind.
//!
//! Kept to a single test so no other test in this binary opens descriptors
//! while the table is being counted.

#![cfg(target_os = "linux")]

use std::path::PathBuf;

use rustix::net::SendFlags;
use sgbridge::net::{Destination, SetupError};

const ROUNDS: usize = 50;

fn open_descriptors() -> usize {
    std::fs::read_dir("/proc/self/fd")
        .expect("read /proc/self/fd")
        .count()
}

fn flags() -> SendFlags {
    SendFlags::DONTWAIT | SendFlags::NOSIGNAL
}

#[test]
fn repeated_failed_setups_leave_descriptor_table_unchanged() {
    let oversized = Destination::Local {
        path: PathBuf::from(format!("/tmp/{}", "p".repeat(300))),
    };
    let unknown_service = Destination::Network {
        host: "127.0.0.1".into(),
        port: "no-such-service".into(),
    };

    // Let the resolver load whatever it keeps open for the process lifetime.
    assert!(matches!(
        unknown_service.setup("fd", flags()),
        Err(SetupError::Resolution { .. })
    ));

    let before = open_descriptors();
    for _ in 0..ROUNDS {
        assert!(matches!(
            oversized.setup("fd", flags()),
            Err(SetupError::AddressOverflow { .. })
        ));
    }
    assert_eq!(open_descriptors(), before, "oversized path opened a socket");

    for _ in 0..ROUNDS {
        assert!(matches!(
            unknown_service.setup("fd", flags()),
            Err(SetupError::Resolution { .. })
        ));
    }
    assert_eq!(open_descriptors(), before, "failed resolution leaked");
}
