//! Endpoint state enums for connection, session, and link

/// Connection states, Part 2.4.6 (TLS/pipelined variants omitted; the
/// engine never pipelines an Open before the header exchange completes)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Nothing sent or received yet
    Start,

    /// Header received, none sent
    HeaderReceived,

    /// Header sent, none received
    HeaderSent,

    /// Headers exchanged
    HeaderExchange,

    /// Open received, none sent
    OpenReceived,

    /// Open sent, none received
    OpenSent,

    /// Open exchanged in both directions
    Opened,

    /// Close received; frames may still be sent
    CloseReceived,

    /// Close sent; nothing further may be written
    CloseSent,

    /// Close sent due to an error; incoming frames are discarded
    Discarding,

    /// Both closes exchanged; the socket may be discarded
    End,
}

/// Session states, Part 2.5.5
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No begin exchanged
    Unmapped,

    /// Begin sent, none received
    BeginSent,

    /// Begin received, none sent
    BeginReceived,

    /// Begin exchanged in both directions
    Mapped,

    /// End sent, none received
    EndSent,

    /// End received, none sent
    EndReceived,

    /// End sent due to an error; incoming frames are discarded
    Discarding,
}

/// Link states, Part 2.6.1
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// No attach exchanged since creation or the last detach
    Detached,

    /// Attach sent, none received
    AttachSent,

    /// Attach received, none sent
    AttachReceived,

    /// Attach exchanged in both directions
    Attached,

    /// Detach sent, none received
    DetachSent,

    /// Detach received, none sent
    DetachReceived,
}
