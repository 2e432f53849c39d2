// Signaling server CLI validation tool
// Checks a running server through its HTTP endpoints and scripted WebSocket sessions

use clap::{Parser, Subcommand};
use colored::*;
use futures::{SinkExt, StreamExt};
use std::io::{self, Write};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout, Duration};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

use tutor_signal::protocol::{ClientMessage, LessonPhase, RoomCode, ServerMessage, StateEvent};

const SCENARIOS: &[(&str, &str)] = &[
    ("connection", "Basic WebSocket connection test"),
    ("create-room", "Room creation flow"),
    ("join-room", "Student join with a lowercase code"),
    ("room-full", "Second student is turned away"),
    ("invalid-room", "Join with an unknown code (error handling)"),
    ("state-relay", "Tutor state events reach the student in order"),
    ("tutor-reclaim", "Tutor reconnects and reclaims the room"),
    ("leave-room", "Explicit leave by student and tutor"),
];

#[derive(Parser)]
#[command(name = "tutor-signal-cli")]
#[command(about = "Tutor signaling server CLI validation tool", long_about = None)]
struct Cli {
    /// Server address (host:port)
    #[arg(short, long, default_value = "127.0.0.1:3001")]
    server: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check server health endpoint
    Health,

    /// Get ICE server configuration
    Config,

    /// Test WebSocket connection
    Connect,

    /// Create a room as tutor
    CreateRoom {
        /// Pre-generated room code to request
        #[arg(short, long)]
        code: Option<String>,

        /// Lesson to attach to the room
        #[arg(short, long)]
        lesson_id: Option<String>,

        /// Keep connection alive (press Ctrl+C to exit)
        #[arg(short, long)]
        keep_alive: bool,
    },

    /// Join a room as student
    JoinRoom {
        /// Room code to join (case-insensitive)
        #[arg(short, long)]
        code: String,

        /// Keep connection alive and print relayed messages
        #[arg(short, long)]
        keep_alive: bool,
    },

    /// Run automated validation scenarios
    Validate {
        /// Run all validation tests
        #[arg(short, long)]
        all: bool,

        /// Test specific scenario
        #[arg(short, long)]
        scenario: Option<String>,
    },

    /// Interactive mode - send custom messages
    Interactive,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match &cli.command {
        Commands::Health => {
            check_health(&cli.server).await;
        }
        Commands::Config => {
            check_config(&cli.server).await;
        }
        Commands::Connect => {
            test_connection(&cli.server).await;
        }
        Commands::CreateRoom {
            code,
            lesson_id,
            keep_alive,
        } => {
            create_room(&cli.server, code.as_deref(), lesson_id.clone(), *keep_alive).await;
        }
        Commands::JoinRoom { code, keep_alive } => {
            join_room(&cli.server, code, *keep_alive).await;
        }
        Commands::Validate { all, scenario } => {
            if *all {
                run_all_validations(&cli.server).await;
            } else if let Some(s) = scenario {
                run_scenario(&cli.server, s).await;
            } else {
                println!("{}", "Use --all or --scenario <name>".yellow());
                list_scenarios();
            }
        }
        Commands::Interactive => {
            interactive_mode(&cli.server).await;
        }
    }
}

fn signal_url(server: &str) -> String {
    format!("ws://{}/signal", server)
}

/// One scripted participant connection.
struct Probe {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl Probe {
    async fn connect(server: &str) -> Option<Self> {
        match connect_async(signal_url(server)).await {
            Ok((ws, _)) => Some(Self { ws }),
            Err(e) => {
                println!("{} Connection failed: {}", "✗".red(), e);
                None
            }
        }
    }

    async fn send(&mut self, message: &ClientMessage) -> bool {
        let text = match serde_json::to_string(message) {
            Ok(text) => text,
            Err(e) => {
                println!("{} Cannot encode {}: {}", "✗".red(), message.name(), e);
                return false;
            }
        };
        if self.ws.send(Message::Text(text)).await.is_err() {
            println!("{} Failed to send {}", "✗".red(), message.name());
            return false;
        }
        true
    }

    /// Next server notification, skipping control frames.
    async fn recv(&mut self, wait: Duration) -> Option<ServerMessage> {
        loop {
            match timeout(wait, self.ws.next()).await {
                Ok(Some(Ok(Message::Text(text)))) => match serde_json::from_str(&text) {
                    Ok(message) => return Some(message),
                    Err(_) => {
                        println!("{} Unparseable response: {}", "✗".yellow(), text);
                        return None;
                    }
                },
                Ok(Some(Ok(Message::Close(_)))) | Ok(None) => return None,
                Ok(Some(Ok(_))) => continue,
                Ok(Some(Err(e))) => {
                    println!("{} Error receiving message: {}", "✗".red(), e);
                    return None;
                }
                Err(_) => return None,
            }
        }
    }

    /// Receive until a message matches, or give up after `wait`.
    async fn wait_for(
        &mut self,
        wait: Duration,
        what: &str,
        mut matches: impl FnMut(&ServerMessage) -> bool,
    ) -> Option<ServerMessage> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let left = deadline.saturating_duration_since(tokio::time::Instant::now());
            match self.recv(left).await {
                Some(message) if matches(&message) => return Some(message),
                Some(_) => continue,
                None => {
                    println!("{} No {} received", "✗".red(), what);
                    return None;
                }
            }
        }
    }

    async fn close(mut self) {
        let _ = self.ws.close(None).await;
    }
}

async fn check_health(server: &str) {
    println!("{}", "Checking server health...".cyan());

    let url = format!("http://{}/health", server);
    let client = reqwest::Client::new();

    match client.get(&url).send().await {
        Ok(resp) => {
            let status = resp.status();
            if status.is_success() {
                println!("{} Health check passed", "✓".green());

                if let Ok(body) = resp.json::<serde_json::Value>().await {
                    println!("  Status: {}", body["status"].as_str().unwrap_or("unknown"));
                    println!("  Total rooms: {}", body["stats"]["totalRooms"]);
                    println!("  Active rooms: {}", body["stats"]["activeRooms"]);
                    println!("  Waiting rooms: {}", body["stats"]["waitingRooms"]);
                    println!("  Timestamp: {}", body["timestamp"].as_str().unwrap_or("unknown"));
                }
            } else {
                println!("{} Health check failed: {}", "✗".red(), status);
            }
        }
        Err(e) => {
            println!("{} Cannot connect to server: {}", "✗".red(), e);
            println!("  Make sure the server is running on {}", server);
        }
    }
}

async fn check_config(server: &str) {
    println!("{}", "Fetching ICE configuration...".cyan());

    let url = format!("http://{}/config", server);
    let client = reqwest::Client::new();

    match client.get(&url).send().await {
        Ok(resp) => {
            if resp.status().is_success() {
                println!("{} Config endpoint accessible", "✓".green());

                if let Ok(body) = resp.json::<serde_json::Value>().await {
                    println!("\nConfiguration:");
                    match serde_json::to_string_pretty(&body) {
                        Ok(pretty) => println!("{}", pretty),
                        Err(_) => println!("{}", body),
                    }
                }
            } else {
                println!("{} Config fetch failed: {}", "✗".red(), resp.status());
            }
        }
        Err(e) => {
            println!("{} Cannot connect to server: {}", "✗".red(), e);
        }
    }
}

async fn test_connection(server: &str) {
    println!("{}", "Testing WebSocket connection...".cyan());

    if let Some(probe) = Probe::connect(server).await {
        println!("{} WebSocket connection established", "✓".green());
        println!("  URL: {}", signal_url(server));
        probe.close().await;
        println!("{} Connection closed cleanly", "✓".green());
    }
}

async fn listen(probe: &mut Probe) {
    loop {
        match timeout(Duration::from_secs(30), probe.ws.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => {
                println!("{} {}", "◀".green(), text.bright_white());
            }
            Ok(Some(Ok(Message::Close(_)))) => {
                println!("{} Server closed the connection", "✗".yellow());
                break;
            }
            Ok(Some(Ok(_))) => continue,
            Ok(Some(Err(e))) => {
                println!("{} Connection error: {}", "✗".red(), e);
                break;
            }
            Ok(None) => {
                println!("{} Connection closed", "✗".yellow());
                break;
            }
            // Quiet period, keep listening
            Err(_) => continue,
        }
    }
}

async fn create_room(
    server: &str,
    code: Option<&str>,
    lesson_id: Option<String>,
    keep_alive: bool,
) {
    println!("{}", "Creating room...".cyan());
    if let Some(code) = code {
        println!("  Requested code: {}", code);
    }

    let Some(mut probe) = Probe::connect(server).await else {
        return;
    };

    let request = ClientMessage::CreateRoom {
        lesson_id,
        room_id: code.map(str::to_string),
    };
    if !probe.send(&request).await {
        return;
    }
    println!("{} create-room sent", "✓".green());
    println!("Waiting for response...");

    let room = match probe.recv(Duration::from_secs(5)).await {
        Some(ServerMessage::RoomCreated { room_id }) => {
            println!("{} Room created successfully!", "✓".green());
            println!("\n{}", "═".repeat(50).green());
            println!("{} {}", "Room code:".bold(), room_id.as_str().green().bold());
            println!("{}", "═".repeat(50).green());
            Some(room_id)
        }
        Some(ServerMessage::CreateError { error, code }) => {
            println!("{} {} ({})", "✗".red(), error, code);
            None
        }
        Some(other) => {
            println!("{} Unexpected response: {:?}", "✗".yellow(), other);
            None
        }
        None => {
            println!("{} Timeout waiting for response", "✗".red());
            None
        }
    };

    match room {
        Some(room) if keep_alive => {
            println!("\n{}", "Connection is being kept alive...".yellow());
            println!("Students can now join room: {}", room.as_str().green().bold());
            println!("Press {} to disconnect.", "Ctrl+C".bold());
            listen(&mut probe).await;
        }
        Some(_) => {
            println!(
                "\n{}",
                "⚠ Note: Connection closed. The room is removed after the grace period.".yellow()
            );
            println!("Use {} to keep the room active.", "--keep-alive".cyan());
        }
        None => {}
    }
}

async fn join_room(server: &str, code: &str, keep_alive: bool) {
    println!("{}", "Joining room...".cyan());
    println!("  Room code: {}", code);

    let Some(mut probe) = Probe::connect(server).await else {
        return;
    };

    let request = ClientMessage::JoinRoom {
        room_id: code.to_string(),
    };
    if !probe.send(&request).await {
        return;
    }
    println!("{} join-room sent", "✓".green());
    println!("Waiting for response...");

    match probe.recv(Duration::from_secs(5)).await {
        Some(ServerMessage::RoomJoined {
            room_id,
            shared_state,
        }) => {
            println!("{} Joined room {}", "✓".green(), room_id.as_str().green().bold());
            if !shared_state.is_empty() {
                println!("  Shared state: {}", serde_json::Value::Object(shared_state));
            }
            if keep_alive {
                println!("Press {} to disconnect.", "Ctrl+C".bold());
                listen(&mut probe).await;
            }
        }
        Some(ServerMessage::JoinError { error, code }) => {
            println!("{} {} ({})", "✗".red(), error, code);
        }
        Some(other) => {
            println!("Response: {:?}", other);
        }
        None => {
            println!("{} Timeout", "✗".red());
        }
    }
}

fn list_scenarios() {
    println!("\n{}", "Available Validation Scenarios:".bold());
    for (name, description) in SCENARIOS {
        println!("  {} - {}", name.cyan(), description);
    }
    println!("\nExample: tutor-signal-cli validate --scenario join-room");
}

async fn run_named(server: &str, scenario: &str) -> Option<bool> {
    let result = match scenario {
        "connection" => validate_connection(server).await,
        "create-room" => validate_create_room(server).await,
        "join-room" => validate_join_room(server).await,
        "room-full" => validate_room_full(server).await,
        "invalid-room" => validate_invalid_room(server).await,
        "state-relay" => validate_state_relay(server).await,
        "tutor-reclaim" => validate_tutor_reclaim(server).await,
        "leave-room" => validate_leave_room(server).await,
        _ => return None,
    };
    Some(result)
}

async fn run_scenario(server: &str, scenario: &str) {
    println!("\n{} {}", "Running scenario:".bold(), scenario.cyan());
    println!("{}", "─".repeat(60));

    match run_named(server, scenario).await {
        Some(true) => println!("\n{} Scenario passed", "✓".green().bold()),
        Some(false) => println!("\n{} Scenario failed", "✗".red().bold()),
        None => {
            println!("{} Unknown scenario: {}", "✗".red(), scenario);
            list_scenarios();
        }
    }
}

async fn run_all_validations(server: &str) {
    println!("\n{}", "Running All Validation Tests".bold().green());
    println!("{}\n", "═".repeat(60).green());

    let mut passed = 0;
    let mut failed = 0;

    for (scenario, _) in SCENARIOS {
        println!("\n{} Testing: {}", "▶".cyan(), scenario.bold());
        println!("{}", "─".repeat(60));

        if run_named(server, scenario).await == Some(true) {
            passed += 1;
        } else {
            failed += 1;
        }

        sleep(Duration::from_millis(200)).await;
    }

    println!("\n{}", "═".repeat(60).green());
    println!("{}", "Validation Summary".bold());
    println!("{}", "═".repeat(60).green());
    println!("  {} Passed: {}", "✓".green(), passed.to_string().green());
    println!("  {} Failed: {}", "✗".red(), failed.to_string().red());
    println!("  Total: {}", passed + failed);

    if failed == 0 {
        println!("\n{}", "All validations passed! 🎉".green().bold());
    } else {
        println!("\n{}", "Some validations failed. Check output above.".yellow());
    }
}

const WAIT: Duration = Duration::from_secs(3);

/// Connect a tutor and create a room; returns the probe and the assigned code.
async fn open_room(server: &str, requested: Option<&RoomCode>) -> Option<(Probe, RoomCode)> {
    let mut tutor = Probe::connect(server).await?;
    let request = ClientMessage::CreateRoom {
        lesson_id: None,
        room_id: requested.map(RoomCode::to_string),
    };
    if !tutor.send(&request).await {
        return None;
    }

    match tutor.recv(WAIT).await {
        Some(ServerMessage::RoomCreated { room_id }) => Some((tutor, room_id)),
        other => {
            println!("{} Room not created: {:?}", "✗".red(), other);
            None
        }
    }
}

/// Connect a student and join `code`; returns the probe on success.
async fn enter_room(server: &str, code: &str) -> Option<Probe> {
    let mut student = Probe::connect(server).await?;
    let request = ClientMessage::JoinRoom {
        room_id: code.to_string(),
    };
    if !student.send(&request).await {
        return None;
    }

    match student.recv(WAIT).await {
        Some(ServerMessage::RoomJoined { .. }) => Some(student),
        other => {
            println!("{} Join failed: {:?}", "✗".red(), other);
            None
        }
    }
}

async fn validate_connection(server: &str) -> bool {
    match Probe::connect(server).await {
        Some(probe) => {
            println!("{} WebSocket connection successful", "✓".green());
            probe.close().await;
            true
        }
        None => false,
    }
}

async fn validate_create_room(server: &str) -> bool {
    let Some((tutor, code)) = open_room(server, None).await else {
        return false;
    };

    let valid = RoomCode::parse(code.as_str()).is_ok();
    if valid {
        println!("{} Room created: {}", "✓".green(), code);
    } else {
        println!("{} Malformed room code: {}", "✗".red(), code);
    }
    tutor.close().await;
    valid
}

async fn validate_join_room(server: &str) -> bool {
    println!("  Step 1: Creating room (tutor connects)...");
    let Some((mut tutor, code)) = open_room(server, None).await else {
        return false;
    };
    println!("{} Room {} created", "✓".green(), code);

    println!("  Step 2: Student joins with lowercase code...");
    let Some(student) = enter_room(server, &code.as_str().to_lowercase()).await else {
        tutor.close().await;
        return false;
    };
    println!("{} Student joined", "✓".green());

    println!("  Step 3: Tutor is notified...");
    let notified = tutor
        .wait_for(WAIT, "peer-joined", |m| matches!(m, ServerMessage::PeerJoined { .. }))
        .await
        .is_some();
    if notified {
        println!("{} Tutor received peer-joined", "✓".green());
    }

    student.close().await;
    tutor.close().await;
    notified
}

async fn validate_room_full(server: &str) -> bool {
    let Some((tutor, code)) = open_room(server, None).await else {
        return false;
    };
    let Some(first) = enter_room(server, code.as_str()).await else {
        tutor.close().await;
        return false;
    };
    println!("{} First student joined", "✓".green());

    let Some(mut second) = Probe::connect(server).await else {
        return false;
    };
    let request = ClientMessage::JoinRoom {
        room_id: code.to_string(),
    };
    let rejected = second.send(&request).await
        && match second.recv(WAIT).await {
            Some(ServerMessage::JoinError { error, code }) if code == "room-full" => {
                println!("{} Second student rejected: {}", "✓".green(), error);
                true
            }
            other => {
                println!("{} Expected room-full, got {:?}", "✗".red(), other);
                false
            }
        };

    second.close().await;
    first.close().await;
    tutor.close().await;
    rejected
}

async fn validate_invalid_room(server: &str) -> bool {
    let Some(mut student) = Probe::connect(server).await else {
        return false;
    };

    let request = ClientMessage::JoinRoom {
        room_id: "ZZZZZZ".to_string(),
    };
    if !student.send(&request).await {
        return false;
    }

    let result = match student.recv(WAIT).await {
        Some(ServerMessage::JoinError { error, code }) if code == "room-not-found" => {
            println!("{} Correctly rejected: {}", "✓".green(), error);
            true
        }
        other => {
            println!("{} Expected room-not-found, got {:?}", "✗".red(), other);
            false
        }
    };
    student.close().await;
    result
}

async fn validate_state_relay(server: &str) -> bool {
    let Some((mut tutor, code)) = open_room(server, None).await else {
        return false;
    };
    let Some(mut student) = enter_room(server, code.as_str()).await else {
        tutor.close().await;
        return false;
    };

    let events = [
        StateEvent::ChangePhase {
            phase: LessonPhase::Vocabulary,
        },
        StateEvent::AddWhiteboardNote {
            note: "Hallo = Hello".to_string(),
        },
    ];
    for event in &events {
        let update = ClientMessage::StateUpdate {
            room_id: code.to_string(),
            state_event: event.clone(),
        };
        if !tutor.send(&update).await {
            return false;
        }
    }

    let mut received = Vec::new();
    while received.len() < events.len() {
        match student
            .wait_for(WAIT, "state-update", |m| matches!(m, ServerMessage::StateUpdate { .. }))
            .await
        {
            Some(ServerMessage::StateUpdate { state_event }) => received.push(state_event),
            _ => break,
        }
    }

    let in_order = received == events;
    if in_order {
        println!("{} Student received {} events in order", "✓".green(), received.len());
    } else {
        println!("{} Relayed events differ: {:?}", "✗".red(), received);
    }

    student.close().await;
    tutor.close().await;
    in_order
}

async fn validate_tutor_reclaim(server: &str) -> bool {
    let Some((tutor, code)) = open_room(server, None).await else {
        return false;
    };
    let Some(mut student) = enter_room(server, code.as_str()).await else {
        tutor.close().await;
        return false;
    };

    println!("  Step 1: Tutor drops the connection...");
    tutor.close().await;
    if student
        .wait_for(WAIT, "peer-left", |m| matches!(m, ServerMessage::PeerLeft { .. }))
        .await
        .is_none()
    {
        return false;
    }
    println!("{} Student saw the tutor leave", "✓".green());

    println!("  Step 2: Tutor reconnects with the same code...");
    let Some((tutor, reclaimed)) = open_room(server, Some(&code)).await else {
        return false;
    };
    if reclaimed != code {
        println!("{} Got a different room: {}", "✗".red(), reclaimed);
        return false;
    }

    let back = student
        .wait_for(WAIT, "peer-joined", |m| matches!(m, ServerMessage::PeerJoined { .. }))
        .await
        .is_some();
    if back {
        println!("{} Room {} reclaimed", "✓".green(), code);
    }

    student.close().await;
    tutor.close().await;
    back
}

async fn validate_leave_room(server: &str) -> bool {
    let Some((mut tutor, code)) = open_room(server, None).await else {
        return false;
    };
    let Some(mut student) = enter_room(server, code.as_str()).await else {
        tutor.close().await;
        return false;
    };

    let leave = ClientMessage::LeaveRoom {
        room_id: code.to_string(),
    };
    if !student.send(&leave).await {
        return false;
    }
    let student_left = tutor
        .wait_for(WAIT, "peer-left", |m| {
            matches!(m, ServerMessage::PeerLeft { reason, .. } if reason == "Student left")
        })
        .await
        .is_some();
    if student_left {
        println!("{} Tutor saw the student leave", "✓".green());
    }

    let Some(mut student) = enter_room(server, code.as_str()).await else {
        return false;
    };
    if !tutor.send(&leave).await {
        return false;
    }
    let closed = student
        .wait_for(WAIT, "room-closed", |m| matches!(m, ServerMessage::RoomClosed { .. }))
        .await
        .is_some();
    if closed {
        println!("{} Student saw the room close", "✓".green());
    }

    student.close().await;
    tutor.close().await;
    student_left && closed
}

async fn interactive_mode(server: &str) {
    println!("\n{}", "Interactive Mode".bold().green());
    println!("{}", "═".repeat(60).green());
    println!("Type {} for help, {} to quit\n", "help".cyan(), "quit".cyan());

    let Some(probe) = Probe::connect(server).await else {
        return;
    };
    println!("{} Connected to server", "✓".green());

    let (mut write, mut read) = probe.ws.split();

    let receive_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = read.next().await {
            if let Message::Text(text) = msg {
                println!("\n{} {}", "◀".green(), text.bright_white());
            }
        }
    });

    loop {
        print!("{} ", "►".cyan());
        let _ = io::stdout().flush();

        let mut input = String::new();
        if io::stdin().read_line(&mut input).is_err() {
            break;
        }

        let input = input.trim();

        if input.is_empty() {
            continue;
        }

        if input == "quit" || input == "exit" {
            println!("Goodbye!");
            break;
        }

        if input == "help" {
            print_interactive_help();
            continue;
        }

        // Typed messages only, so typos are caught before they reach the server
        match serde_json::from_str::<ClientMessage>(input) {
            Ok(message) => match serde_json::to_string(&message) {
                Ok(text) if write.send(Message::Text(text.clone())).await.is_ok() => {
                    println!("{} {} sent", "✓".green(), message.name());
                }
                _ => {
                    println!("{} Failed to send message", "✗".red());
                    break;
                }
            },
            Err(e) => {
                println!("{} Invalid message: {}. Type 'help' for examples.", "✗".yellow(), e);
            }
        }
    }

    receive_task.abort();
}

fn print_interactive_help() {
    println!("\n{}", "Interactive Mode Commands".bold());
    println!("{}", "─".repeat(60));
    println!("Send JSON messages directly to the server.\n");

    println!("{}", "Example Messages:".bold());
    println!("\n{}:", "Create Room".cyan());
    println!(r#"  {{"type":"create-room","roomId":"AB3D7K","lessonId":null}}"#);

    println!("\n{}:", "Join Room".cyan());
    println!(r#"  {{"type":"join-room","roomId":"ab3d7k"}}"#);

    println!("\n{}:", "State Update".cyan());
    println!(
        r#"  {{"type":"state-update","roomId":"AB3D7K","stateEvent":{{"type":"CHANGE_PHASE","phase":"grammar"}}}}"#
    );

    println!("\n{}:", "ICE Candidate".cyan());
    println!(
        r#"  {{"type":"ice-candidate","roomId":"AB3D7K","candidate":{{"candidate":"candidate:...","sdpMid":"0","sdpMLineIndex":0}}}}"#
    );

    println!("\n{}:", "Leave".cyan());
    println!(r#"  {{"type":"leave-room","roomId":"AB3D7K"}}"#);

    println!("\n{}: quit, exit", "Commands".bold());
    println!();
}
