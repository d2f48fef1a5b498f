use std::net::SocketAddr;

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the chat server, accepting TCP connections.
    Server(ServerArgs),
    /// Join a conversation and chat from the terminal.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServerArgs {
    /// Socket address the server should bind to. Use port 0 for an
    /// ephemeral port.
    #[arg(long, default_value = "127.0.0.1:4242")]
    pub listen: SocketAddr,
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Display name shown to other participants.
    #[arg(long)]
    pub name: String,

    /// Conversation to join; created on first use.
    #[arg(long)]
    pub conversation: String,

    /// Address of the server to connect to.
    #[arg(long, default_value = "127.0.0.1:4242")]
    pub server: SocketAddr,
}
