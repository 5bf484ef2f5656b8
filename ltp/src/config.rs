use std::time::Duration;

/// Configuration for one [`crate::engine::LtpEngine`].
///
/// Field names and defaults mirror the original `LtpEngineConfig` layout:
/// each field documents the same behavior, just expressed with Rust types
/// (`Duration` instead of a separate milliseconds integer, `Option` instead
/// of a magic zero).
#[derive(Clone, Debug)]
pub struct EngineConfig {
	/// This engine's own id.
	pub this_engine_id: u64,
	/// The id of the single remote engine this instance talks to.
	pub remote_engine_id: u64,
	/// This engine's index on a shared port, embedded in the low byte of
	/// every session number it originates so replies can be demultiplexed
	/// back to it without a connected 1:1 socket per engine.
	pub engine_index: u8,
	/// Copied into outgoing data segments; not validated by receivers.
	pub client_service_id: u64,
	/// True for a receiver-only engine, false for a sender-only engine.
	pub is_induct: bool,

	/// Max client-service data bytes per data segment.
	pub mtu_client_service_data: usize,
	/// Max bytes per report segment. `None` means unlimited.
	pub mtu_report_segment: Option<usize>,

	/// One-way light time. Retransmission RTT is `2 * (owlt + owmt)`.
	pub one_way_light_time: Duration,
	/// One-way margin (processing) time.
	pub one_way_margin_time: Duration,

	/// Inbound packet queue depth; excess packets are dropped and counted.
	pub num_udp_rx_circular_buffer_vectors: usize,
	/// Initial receiver block-buffer reservation.
	pub estimated_bytes_per_session: usize,
	/// Hard ceiling on a single session's red bytes, to reject bad offsets.
	pub max_red_rx_bytes_per_session: u64,

	/// `0` disables discretionary checkpoints.
	pub checkpoint_every_nth_data_packet: u32,
	/// Retry budget before a checkpoint/report/cancel-ack gives up.
	pub max_retries_per_serial_number: u32,

	/// Constrain generated session numbers to 32 bits (CCSDS/ION compatible).
	pub force_32_bit_random_numbers: bool,

	/// `None` disables the rate limiter.
	pub max_send_rate_bits_per_sec: Option<u64>,
	/// Averaging window for the rate limiter.
	pub rate_limit_precision: Duration,

	/// Sizes the session hash maps; also gates the on-disk store.
	pub max_simultaneous_sessions: usize,
	/// Size of the closed-receiver-session anti-replay history. `0` disables it.
	pub rx_session_recreation_preventer_history_size: usize,

	/// Packets per `sendmmsg`/batched syscall. `1` forces one syscall per packet.
	pub max_udp_packets_to_send_per_system_call: usize,

	/// `None` disables sender pings. Must be `None` on inducts.
	pub sender_ping_interval: Option<Duration>,

	/// Deferred-report window. Must be `None` on outducts.
	pub delay_sending_of_report_segments: Option<Duration>,
	/// Deferred-retransmission window. Must be `None` on inducts.
	pub delay_sending_of_data_segments: Option<Duration>,

	/// `None` keeps session data in memory; `Some` rolls an on-disk file at this interval.
	pub active_session_data_on_disk_new_file_duration: Option<Duration>,
	/// Base directory for the on-disk store, used only if the above is `Some`.
	pub active_session_data_on_disk_directory: std::path::PathBuf,
}

/// A configuration value was rejected; the field name and reason are included for logging.
#[derive(thiserror::Error, Debug)]
#[error("invalid LTP engine configuration: {0}")]
pub struct ConfigError(pub String);

impl EngineConfig {
	/// Validates cross-field invariants the spec requires to be rejected at
	/// construction rather than discovered at runtime.
	pub fn validate(&self) -> Result<(), ConfigError> {
		if self.is_induct && self.sender_ping_interval.is_some() {
			return Err(ConfigError("sender_ping_interval must be disabled on an induct".into()));
		}

		if self.is_induct && self.delay_sending_of_data_segments.is_some() {
			return Err(ConfigError("delay_sending_of_data_segments must be disabled on an induct".into()));
		}

		if !self.is_induct && self.delay_sending_of_report_segments.is_some() {
			return Err(ConfigError("delay_sending_of_report_segments must be disabled on an outduct".into()));
		}

		if self.mtu_client_service_data == 0 {
			return Err(ConfigError("mtu_client_service_data must be nonzero".into()));
		}

		if self.max_retries_per_serial_number == 0 {
			return Err(ConfigError("max_retries_per_serial_number must be nonzero".into()));
		}

		if let Some(dur) = self.active_session_data_on_disk_new_file_duration {
			if dur < Duration::from_secs(1) {
				return Err(ConfigError("active_session_data_on_disk_new_file_duration must be at least 1000ms".into()));
			}

			if self.max_simultaneous_sessions < 8 {
				return Err(ConfigError("on-disk session storage requires max_simultaneous_sessions >= 8".into()));
			}
		}

		Ok(())
	}
}

impl Default for EngineConfig {
	fn default() -> Self {
		Self {
			this_engine_id: 0,
			remote_engine_id: 0,
			engine_index: 0,
			client_service_id: 0,
			is_induct: false,

			mtu_client_service_data: 1360,
			mtu_report_segment: Some(1360),

			one_way_light_time: Duration::from_millis(1000),
			one_way_margin_time: Duration::from_millis(200),

			num_udp_rx_circular_buffer_vectors: 1000,
			estimated_bytes_per_session: 1_000_000,
			max_red_rx_bytes_per_session: 10_000_000,

			checkpoint_every_nth_data_packet: 0,
			max_retries_per_serial_number: 5,

			force_32_bit_random_numbers: false,

			max_send_rate_bits_per_sec: None,
			rate_limit_precision: Duration::from_millis(100),

			max_simultaneous_sessions: 5000,
			rx_session_recreation_preventer_history_size: 0,

			max_udp_packets_to_send_per_system_call: 1,

			sender_ping_interval: None,
			delay_sending_of_report_segments: None,
			delay_sending_of_data_segments: None,

			active_session_data_on_disk_new_file_duration: None,
			active_session_data_on_disk_directory: "./".into(),
		}
	}
}

impl EngineConfig {
	/// Round-trip retransmission timeout: `2 * (one_way_light_time + one_way_margin_time)`.
	pub fn retransmission_timeout(&self) -> Duration {
		2 * (self.one_way_light_time + self.one_way_margin_time)
	}
}
