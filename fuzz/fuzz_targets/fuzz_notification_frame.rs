#![no_main]

use activity_sync_client::protocol::RemoteNotification;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(frame) = std::str::from_utf8(data) else {
        return;
    };
    if let Some(notification) = RemoteNotification::parse(frame) {
        let _ = notification.payload_id();
        let _ = RemoteNotification::parse(&notification.to_frame());
    }
});
