use anyhow::{Context, Result};
use clap::{Args, Parser};
use std::path::PathBuf;
use std::sync::Arc;
use tandem::config::SessionConfig;
use tandem::media::SyntheticDevices;
use tandem::meeting::{HttpMeetingDirectory, MeetingDirectory};
use tandem::signaling::WebSocketRelay;
use tandem::telemetry::logging::{self as logctl, LogConfig, LogLevel};
use tandem::transport::WebRtcTransportFactory;
use tandem::transport::stun::fetch_closest_stun;
use tandem::{ChatChannel, ChatError, CoordinatorDeps, MediaConstraints, SessionCoordinator};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, warn};

#[derive(Parser, Debug)]
#[command(
    name = "tandem",
    about = "Join a two-party video meeting over a signaling relay",
    author,
    version
)]
struct Cli {
    #[arg(
        long,
        env = "TANDEM_RELAY_URL",
        default_value = "ws://127.0.0.1:8080",
        help = "Base URL of the signaling relay"
    )]
    relay: String,

    #[arg(long, short = 'm', env = "TANDEM_MEETING_ID", help = "Meeting to join")]
    meeting: String,

    #[arg(
        long,
        short = 'p',
        env = "TANDEM_PARTICIPANT_ID",
        help = "Local participant id"
    )]
    participant: String,

    #[arg(long, env = "TANDEM_API_URL", help = "Meetings API used to look up the counterpart")]
    api: Option<String>,

    #[arg(long, env = "TANDEM_API_TOKEN", requires = "api", hide_env_values = true)]
    token: Option<String>,

    #[arg(long, help = "Join without a camera")]
    no_video: bool,

    #[arg(long, help = "Pick the public STUN server closest to this machine")]
    closest_stun: bool,

    #[command(flatten)]
    logging: LoggingArgs,
}

#[derive(Args, Debug, Clone)]
struct LoggingArgs {
    #[arg(
        long = "log-level",
        value_enum,
        env = "TANDEM_LOG_LEVEL",
        default_value_t = LogLevel::Warn,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    level: LogLevel,

    #[arg(
        long = "log-file",
        value_name = "PATH",
        env = "TANDEM_LOG_FILE",
        help = "Write structured logs to the specified file"
    )]
    file: Option<PathBuf>,
}

impl LoggingArgs {
    fn to_config(&self) -> LogConfig {
        LogConfig {
            level: self.level,
            file: self.file.clone(),
        }
    }
}

enum Command {
    Mute,
    Video,
    Screen,
    Leave,
    Chat(String),
}

fn parse_command(line: &str) -> Command {
    match line.trim() {
        "/mute" => Command::Mute,
        "/video" => Command::Video,
        "/screen" => Command::Screen,
        "/leave" | "/quit" => Command::Leave,
        _ => Command::Chat(line.to_owned()),
    }
}

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("tandem: {err:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let log_config = cli.logging.to_config();
    logctl::init(&log_config).context("configuring logging")?;
    debug!(log_level = ?log_config.level, log_file = ?log_config.file, "logging configured");

    let mut config = SessionConfig::from_env();
    if cli.closest_stun {
        match fetch_closest_stun(&reqwest::Client::new()).await {
            Ok(server) => config = config.with_ice_servers(vec![server]),
            Err(err) => warn!(error = %err, "closest stun lookup failed; keeping defaults"),
        }
    }

    let counterpart = match (&cli.api, &cli.token) {
        (Some(api), Some(token)) => {
            let directory = HttpMeetingDirectory::new(api, token.clone())?;
            let record = directory
                .meeting(&cli.meeting)
                .await
                .context("looking up meeting")?;
            Some(record.counterpart_of(&cli.participant).full_name.clone())
        }
        _ => None,
    };
    let counterpart = counterpart.unwrap_or_else(|| "peer".to_owned());

    let relay = WebSocketRelay::new(&cli.relay)?;
    let coordinator = SessionCoordinator::new(
        CoordinatorDeps {
            relay: Arc::new(relay),
            devices: Arc::new(SyntheticDevices::new()),
            transports: Arc::new(WebRtcTransportFactory::new()),
        },
        config,
    );

    let _state_sub = {
        let counterpart = counterpart.clone();
        coordinator.on_state_change(move |state| {
            let remote = match state.remote_track_state {
                Some(tracks) => format!(
                    "{counterpart}: audio {} video {} screen {}",
                    on_off(tracks.audio_enabled),
                    on_off(tracks.video_enabled),
                    on_off(tracks.screen_sharing)
                ),
                None => format!("waiting for {counterpart}"),
            };
            println!("[{}] {remote}", state.connection_phase);
            if let Some(fault) = &state.last_error {
                println!("  ! {fault}");
            }
        })
    };

    let constraints = MediaConstraints {
        audio: true,
        video: !cli.no_video,
    };
    coordinator
        .join(&cli.meeting, &cli.participant, constraints)
        .await
        .context("joining meeting")?;
    println!("joined {} as {}; /mute /video /screen /leave", cli.meeting, cli.participant);

    let chat = coordinator.chat().await.context("chat unavailable")?;
    let _chat_sub = {
        let counterpart = counterpart.clone();
        chat.on_message(move |message| {
            println!("{counterpart} ({}): {}", message.sender_id, message.text);
        })
    };

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => {
                let Some(line) = line.context("reading stdin")? else {
                    break;
                };
                if !handle_command(&coordinator, &chat, parse_command(&line)).await {
                    break;
                }
            }
        }
    }

    coordinator.leave().await;
    println!("left {}", cli.meeting);
    Ok(())
}

async fn handle_command(
    coordinator: &SessionCoordinator,
    chat: &ChatChannel,
    command: Command,
) -> bool {
    let outcome = match command {
        Command::Leave => return false,
        Command::Mute => coordinator
            .toggle_audio()
            .await
            .map(|on| format!("microphone {}", on_off(on))),
        Command::Video => coordinator
            .toggle_video()
            .await
            .map(|on| format!("camera {}", on_off(on))),
        Command::Screen => coordinator
            .toggle_screen_share()
            .await
            .map(|on| format!("screen share {}", on_off(on))),
        Command::Chat(text) => {
            match chat.send(&text) {
                Ok(_) | Err(ChatError::Empty) => {}
                Err(err) => println!("  ! {err}"),
            }
            return true;
        }
    };
    match outcome {
        Ok(message) => println!("{message}"),
        Err(err) => println!("  ! {err}"),
    }
    true
}

fn on_off(enabled: bool) -> &'static str {
    if enabled { "on" } else { "off" }
}
