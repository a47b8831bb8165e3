#[macro_use]
extern crate afl;
use sealed_session::{
    BundleDirectory, EngineConfig, Error, KeyManager, MemorySessionStore, PreKeyBundle,
    SessionEngine,
};
use std::sync::Arc;

struct Peer(Arc<KeyManager>);

impl BundleDirectory for Peer {
    fn fetch_bundle(&self, _identity: &str, _device_id: u32) -> Result<PreKeyBundle, Error> {
        self.0.publish_bundle()
    }
}

fn key_manager() -> Arc<KeyManager> {
    let key_manager = Arc::new(KeyManager::new(EngineConfig::default()));
    key_manager.generate_identity(false).expect("Setup failed");
    key_manager
        .replenish_one_time_pre_keys(100)
        .expect("Setup failed");
    key_manager
}

fn main() {
    // The victim holds an unconfirmed session with the attacker's device
    let attacker = key_manager();
    let victim = SessionEngine::new(
        key_manager(),
        1,
        MemorySessionStore::new(),
        Peer(Arc::clone(&attacker)),
    );
    victim.encrypt("attacker", 1, b"hello").expect("Setup failed");

    fuzz!(|data: &[u8]| {
        let _ = victim.decrypt("attacker", 1, data);
        let _ = victim.decrypt("stranger", 1, data);
    });
}
