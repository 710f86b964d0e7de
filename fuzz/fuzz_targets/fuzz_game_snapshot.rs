#![no_main]

use activity_sync_client::protocol::{ApiResponse, GameSnapshot};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Exercise the raw-byte path, including serde_json's UTF-8 validation.
    if let Ok(snapshot) = serde_json::from_slice::<GameSnapshot>(data) {
        let _ = snapshot.phase();
        let _ = snapshot.standings();
        let _ = snapshot.round_seconds();
    }

    // The enveloped form returned by the game details endpoint.
    if let Ok(response) = serde_json::from_slice::<ApiResponse<GameSnapshot>>(data) {
        let _ = response.into_data();
    }
});
