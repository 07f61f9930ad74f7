// STOMP 1.2 support for the chat session
// https://stomp.github.io/stomp-specification-1.2.html

pub mod frame;

pub use frame::{Command, Frame, FrameError};

// Header names used by the session
pub mod header {
    pub const ACCEPT_VERSION: &str = "accept-version";
    pub const HOST: &str = "host";
    pub const HEART_BEAT: &str = "heart-beat";
    pub const LOGIN: &str = "login";
    pub const PASSCODE: &str = "passcode";
    pub const VERSION: &str = "version";
    pub const DESTINATION: &str = "destination";
    pub const ID: &str = "id";
    pub const ACK: &str = "ack";
    pub const SUBSCRIPTION: &str = "subscription";
    pub const MESSAGE_ID: &str = "message-id";
    pub const CONTENT_TYPE: &str = "content-type";
    pub const CONTENT_LENGTH: &str = "content-length";
    pub const RECEIPT: &str = "receipt";
    pub const MESSAGE: &str = "message";
}

pub const SUPPORTED_VERSIONS: &str = "1.2,1.1";
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// CONNECT frame for the given virtual host.
pub fn connect_frame(host: &str, login: Option<(&str, &str)>) -> Frame {
    let mut frame = Frame::new(Command::Connect)
        .header(header::ACCEPT_VERSION, SUPPORTED_VERSIONS)
        .header(header::HOST, host)
        .header(header::HEART_BEAT, "0,0");
    if let Some((login, passcode)) = login {
        frame = frame
            .header(header::LOGIN, login)
            .header(header::PASSCODE, passcode);
    }
    frame
}

pub fn subscribe_frame(id: &str, destination: &str) -> Frame {
    Frame::new(Command::Subscribe)
        .header(header::ID, id)
        .header(header::DESTINATION, destination)
        .header(header::ACK, "auto")
}

pub fn unsubscribe_frame(id: &str) -> Frame {
    Frame::new(Command::Unsubscribe).header(header::ID, id)
}

/// SEND frame carrying a JSON body.
pub fn send_frame(destination: &str, json: String) -> Frame {
    Frame::new(Command::Send)
        .header(header::DESTINATION, destination)
        .header(header::CONTENT_TYPE, JSON_CONTENT_TYPE)
        .body(json)
}

pub fn disconnect_frame() -> Frame {
    Frame::new(Command::Disconnect)
}
