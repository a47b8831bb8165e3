use std::time::Duration;

const DAY: Duration = Duration::from_secs(24 * 60 * 60);

/// Tunables shared by the key manager and every session it creates.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EngineConfig {
    /// Largest jump ahead of a receiving chain that a single message may cause.
    pub max_skip: u32,
    /// Upper bound on cached skipped message keys per session; oldest are evicted first.
    pub max_cached_skipped_keys: usize,
    /// Age at which the signed pre-key is due for rotation.
    pub signed_pre_key_rotation_interval: Duration,
    /// How long a retired signed pre-key still answers late handshakes.
    pub signed_pre_key_grace_period: Duration,
    /// Pool size below which one-time pre-keys are replenished.
    pub min_one_time_pre_keys: usize,
    /// Pool size replenishment tops up to.
    pub max_one_time_pre_keys: usize,
    /// How long a one-time pre-key handed out in a bundle stays reserved.
    pub one_time_pre_key_reservation_timeout: Duration,
    /// HKDF info for the X3DH secret. Both parties must agree on it.
    pub protocol_info: Vec<u8>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_skip: 1000,
            max_cached_skipped_keys: 2000,
            signed_pre_key_rotation_interval: 7 * DAY,
            signed_pre_key_grace_period: 14 * DAY,
            min_one_time_pre_keys: 20,
            max_one_time_pre_keys: 100,
            one_time_pre_key_reservation_timeout: Duration::from_secs(10 * 60),
            protocol_info: b"SealedSession-v1".to_vec(),
        }
    }
}
