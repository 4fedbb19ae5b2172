use pcsc::{Card, Context, Disposition, Protocols, ReaderState, Scope, ShareMode, State, MAX_BUFFER_SIZE};
use serde::{Deserialize, Serialize};
use std::ffi::CString;
use std::time::{Duration, Instant};

use crate::core::error::LinkError;
use crate::core::utils::format_hex;

/// Connection state of a transport link
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TransportSession {
    pub connected: bool,
    pub reader_index: Option<usize>,
}

/// Information about a PCSC reader
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReaderInfo {
    pub name: String,
    pub has_card: bool,
    pub atr: Option<Vec<u8>>,
}

/// The connection to exactly one reader and the card inside it.
///
/// Only `transmit_raw`, `connect`, `reset` and `wait_for_card` block.
/// Status words are returned as-is and never interpreted here.
pub trait CardLink {
    /// List reader names; fails with `LinkError::Reader` when there are none
    fn enumerate(&mut self) -> Result<Vec<String>, LinkError>;

    /// Bind the link to a reader of the last enumeration
    fn select(&mut self, index: usize) -> Result<(), LinkError>;

    /// Open a card session on the selected reader, dropping any previous one
    fn connect(&mut self) -> Result<(), LinkError>;

    /// Release the card session; a no-op when not connected
    fn disconnect(&mut self);

    /// Disconnect then connect again
    fn reset(&mut self) -> Result<(), LinkError>;

    /// Answer-To-Reset of the connected card
    fn atr(&self) -> Result<Vec<u8>, LinkError>;

    /// Send one APDU, returning the response body and the two status bytes
    fn transmit_raw(&mut self, apdu: &[u8]) -> Result<(Vec<u8>, [u8; 2]), LinkError>;

    /// Block until a card is inserted, then connect.
    ///
    /// `None` waits forever. With `new_card_only`, a card already in the
    /// reader does not count.
    fn wait_for_card(&mut self, timeout: Option<Duration>, new_card_only: bool)
        -> Result<(), LinkError>;

    fn session(&self) -> TransportSession;
}

/// Protocol negotiated on connect
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolPreference {
    #[default]
    T0,
    T1,
    Any,
}

impl From<ProtocolPreference> for Protocols {
    fn from(protocol: ProtocolPreference) -> Self {
        match protocol {
            ProtocolPreference::T0 => Protocols::T0,
            ProtocolPreference::T1 => Protocols::T1,
            ProtocolPreference::Any => Protocols::ANY,
        }
    }
}

impl std::str::FromStr for ProtocolPreference {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "t0" | "t=0" => Ok(ProtocolPreference::T0),
            "t1" | "t=1" => Ok(ProtocolPreference::T1),
            "any" => Ok(ProtocolPreference::Any),
            _ => Err(format!("Invalid protocol: {s}")),
        }
    }
}

/// PCSC-backed transport link
pub struct PcscLink {
    context: Context,
    readers: Vec<CString>,
    selected: Option<usize>,
    card: Option<Card>,
    share_mode: ShareMode,
    protocols: Protocols,
}

impl PcscLink {
    /// Establish a PCSC context
    pub fn new(share_mode: ShareMode, protocol: ProtocolPreference) -> Result<Self, LinkError> {
        let context = Context::establish(Scope::User)
            .map_err(|e| LinkError::Protocol(format!("Failed to establish PCSC context: {e}")))?;

        Ok(Self {
            context,
            readers: Vec::new(),
            selected: None,
            card: None,
            share_mode,
            protocols: protocol.into(),
        })
    }

    /// List readers together with card presence and ATR
    pub fn list_readers(&mut self) -> Result<Vec<ReaderInfo>, LinkError> {
        let names = self.enumerate()?;

        Ok(names
            .into_iter()
            .zip(self.readers.iter())
            .map(|(name, cname)| {
                let atr = self.probe_atr(cname);
                ReaderInfo {
                    name,
                    has_card: atr.is_some(),
                    atr,
                }
            })
            .collect())
    }

    /// Name of the selected reader
    pub fn selected_reader(&self) -> Option<String> {
        self.selected_name()
            .map(|name| name.to_string_lossy().into_owned())
    }

    fn probe_atr(&self, reader: &CString) -> Option<Vec<u8>> {
        let mut states = [ReaderState::new(reader.clone(), State::UNAWARE)];
        self.context
            .get_status_change(Some(Duration::ZERO), &mut states)
            .ok()?;

        let state = states[0].event_state();
        (state.contains(State::PRESENT) && !state.contains(State::EMPTY))
            .then(|| states[0].atr().to_vec())
    }

    fn selected_name(&self) -> Option<&CString> {
        self.selected.and_then(|index| self.readers.get(index))
    }

    fn card(&self) -> Result<&Card, LinkError> {
        self.card
            .as_ref()
            .ok_or_else(|| LinkError::NoCard("Not connected to a card".to_string()))
    }
}

fn check_readers_present(count: usize) -> Result<(), LinkError> {
    if count == 0 {
        return Err(LinkError::Reader("No reader found".to_string()));
    }
    Ok(())
}

fn check_reader_index(index: usize, count: usize) -> Result<(), LinkError> {
    if index >= count {
        return Err(LinkError::Reader(format!(
            "No reader found for number {index}"
        )));
    }
    Ok(())
}

impl CardLink for PcscLink {
    fn enumerate(&mut self) -> Result<Vec<String>, LinkError> {
        let readers = match self.context.list_readers_owned() {
            Ok(readers) => readers,
            Err(pcsc::Error::NoReadersAvailable) => Vec::new(),
            Err(e) => return Err(e.into()),
        };

        check_readers_present(readers.len())?;
        self.readers = readers;
        Ok(self
            .readers
            .iter()
            .map(|name| name.to_string_lossy().into_owned())
            .collect())
    }

    fn select(&mut self, index: usize) -> Result<(), LinkError> {
        check_reader_index(index, self.readers.len())?;

        self.disconnect();
        self.selected = Some(index);
        log::info!("Selected reader [{index}]: {:?}", self.readers[index]);
        Ok(())
    }

    fn connect(&mut self) -> Result<(), LinkError> {
        self.disconnect();

        let reader = self
            .selected_name()
            .cloned()
            .ok_or_else(|| LinkError::Reader("No reader selected".to_string()))?;

        log::info!("Connecting to reader: {reader:?}");
        let card = self.context.connect(&reader, self.share_mode, self.protocols)?;

        self.card = Some(card);
        log::info!("Successfully connected to reader: {reader:?}");
        Ok(())
    }

    fn disconnect(&mut self) {
        if let Some(card) = self.card.take() {
            let _ = card
                .disconnect(Disposition::LeaveCard)
                .map_err(|_e| log::warn!("Failed to disconnect cleanly from card"));
            log::info!("Disconnected from card");
        }
    }

    fn reset(&mut self) -> Result<(), LinkError> {
        if let Some(card) = self.card.take() {
            let _ = card
                .disconnect(Disposition::ResetCard)
                .map_err(|_e| log::warn!("Failed to reset card on disconnect"));
        }
        self.connect()
    }

    fn atr(&self) -> Result<Vec<u8>, LinkError> {
        let status = self.card()?.status2_owned()?;
        Ok(status.atr().to_vec())
    }

    fn transmit_raw(&mut self, apdu: &[u8]) -> Result<(Vec<u8>, [u8; 2]), LinkError> {
        let card = self.card()?;

        log::info!("Transmitting APDU: {}", format_hex(apdu));

        let mut response_buf = [0; MAX_BUFFER_SIZE];
        let response = card.transmit(apdu, &mut response_buf)?;

        match response {
            [body @ .., sw1, sw2] => {
                log::debug!("Received response: {} SW {sw1:02X}{sw2:02X}", format_hex(body));
                Ok((body.to_vec(), [*sw1, *sw2]))
            }
            _ => Err(LinkError::Protocol(format!(
                "Response too short for a status word: {}",
                format_hex(response)
            ))),
        }
    }

    fn wait_for_card(
        &mut self,
        timeout: Option<Duration>,
        new_card_only: bool,
    ) -> Result<(), LinkError> {
        let reader = self
            .selected_name()
            .cloned()
            .ok_or_else(|| LinkError::Reader("No reader selected".to_string()))?;

        let deadline = timeout.map(|t| Instant::now() + t);
        let mut states = [ReaderState::new(reader, State::UNAWARE)];

        // First call reports the current state without blocking
        self.context
            .get_status_change(Some(Duration::ZERO), &mut states)?;

        let present = |rs: &ReaderState| {
            let state = rs.event_state();
            state.contains(State::PRESENT) && !state.contains(State::EMPTY)
        };

        if !(present(&states[0]) && !new_card_only) {
            loop {
                states[0].sync_current_state();

                let remaining = match deadline {
                    Some(deadline) => {
                        let now = Instant::now();
                        if now >= deadline {
                            return Err(LinkError::NoCard("Timed out waiting for card".to_string()));
                        }
                        Some(deadline - now)
                    }
                    None => None,
                };

                match self.context.get_status_change(remaining, &mut states) {
                    Ok(()) => {}
                    Err(pcsc::Error::Timeout) => {
                        return Err(LinkError::NoCard("Timed out waiting for card".to_string()))
                    }
                    Err(e) => return Err(e.into()),
                }

                let state = states[0].event_state();
                if present(&states[0]) && state.contains(State::CHANGED) {
                    break;
                }
            }
        }

        log::info!("Card detected");
        self.connect()
    }

    fn session(&self) -> TransportSession {
        TransportSession {
            connected: self.card.is_some(),
            reader_index: self.selected,
        }
    }
}

impl Drop for PcscLink {
    fn drop(&mut self) {
        self.disconnect();
    }
}
