//! Minimal command-line harness for manually exercising one [`ltp::LtpEngine`]
//! over UDP. Not a production dashboard — just enough to send a block to a
//! peer instance and watch the stats and delivered bytes go by.

use std::net::SocketAddr;
use std::time::Duration;

use clap::Parser;
use ltp::transport::Transport;
use ltp::{Delivery, EngineConfig, LinkStatus, LtpEngine};
use log::info;
use stakker::{actor, fwd_to, ret_nop, CX};

/// Run one LTP engine against a single configured remote peer.
#[derive(Parser, Debug)]
struct Args {
	/// Local UDP address to bind.
	#[arg(long)]
	local: SocketAddr,

	/// Remote engine's UDP address.
	#[arg(long)]
	remote: SocketAddr,

	/// This engine's id.
	#[arg(long, default_value_t = 1)]
	engine_id: u64,

	/// The single remote engine's id.
	#[arg(long, default_value_t = 2)]
	remote_engine_id: u64,

	/// Client service id carried on outgoing data segments.
	#[arg(long, default_value_t = 1)]
	client_service_id: u64,

	/// Run as a receiver-only induct instead of a sender-only outduct.
	#[arg(long)]
	induct: bool,

	/// Max client-service-data bytes per data segment.
	#[arg(long, default_value_t = 1360)]
	mtu: usize,

	/// One-way light time, in milliseconds.
	#[arg(long, default_value_t = 1000)]
	owlt_ms: u64,

	/// Link-liveness ping interval, in milliseconds. Outducts only.
	#[arg(long)]
	ping_interval_ms: Option<u64>,

	/// Red bytes to send once at startup (outducts only).
	#[arg(long)]
	send_red: Option<String>,

	/// Green bytes to send once at startup (outducts only).
	#[arg(long)]
	send_green: Option<String>,
}

struct DeliveryLog;

impl DeliveryLog {
	fn init(_: CX![]) -> Option<Self> {
		Some(Self)
	}

	fn log(&mut self, _: CX![], delivery: Delivery) {
		match delivery {
			Delivery::Red { session, client_service_id, data } => {
				info!("red part delivered: session={session:?} client_service_id={client_service_id} bytes={}", data.len());
			}
			Delivery::Green { session, client_service_id, data } => {
				info!("green segment delivered: session={session:?} client_service_id={client_service_id} bytes={}", data.len());
			}
		}
	}

	fn link_status(&mut self, _: CX![], status: LinkStatus) {
		info!("link status changed: {status:?}");
	}
}

fn main() {
	runtime::logger::init(log::LevelFilter::Info);

	let args = Args::parse();

	let config = EngineConfig {
		this_engine_id: args.engine_id,
		remote_engine_id: args.remote_engine_id,
		client_service_id: args.client_service_id,
		is_induct: args.induct,
		mtu_client_service_data: args.mtu,
		one_way_light_time: Duration::from_millis(args.owlt_ms),
		sender_ping_interval: args.ping_interval_ms.map(Duration::from_millis),
		..Default::default()
	};

	let mut stakker = runtime::init();

	let log_actor = actor!(stakker, DeliveryLog::init(), ret_nop!());
	let delivery = fwd_to!([log_actor], log() as (Delivery));
	let link_status = fwd_to!([log_actor], link_status() as (LinkStatus));

	let local = args.local;
	let remote = args.remote;
	let engine = actor!(
		stakker,
		LtpEngine::<Transport>::init(config, delivery, link_status, move |read_fwd| Transport::new(local, remote, read_fwd)),
		ret_nop!()
	);

	if let Some(red) = args.send_red {
		let green = args.send_green.unwrap_or_default();
		stakker::call!([engine], send(args.client_service_id, red.into_bytes(), green.into_bytes()));
	} else if let Some(green) = args.send_green {
		stakker::call!([engine], send(args.client_service_id, Vec::new(), green.into_bytes()));
	}

	let _ = runtime::exec(&mut stakker, || {
		info!("Shutting down LTP engine");
		stakker::call!([engine], log_stats());
	});
}
