use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Application message command codes. Control messages (header flag `CONTROL`) have a separate
///  code space and are not represented here.
#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
pub enum Command {
    Beacon = 0,
    ConnectionValidation = 1,
    Echo = 2,
    Search = 3,
    SearchResponse = 4,
    CreateChannel = 7,
    DestroyChannel = 8,
    ConnectionValidated = 9,
    Get = 10,
    Put = 11,
    PutGet = 12,
    Monitor = 13,
    Array = 14,
    DestroyRequest = 15,
    Process = 16,
    GetField = 17,
    Message = 18,
    MultipleData = 19,
    Rpc = 20,
    CancelRequest = 21,
}

impl Command {
    /// commands whose responses are correlated to a pending request by their ioid
    pub fn is_data_response(self) -> bool {
        matches!(self,
            Command::Get | Command::Put | Command::PutGet | Command::Monitor | Command::Array
            | Command::Process | Command::GetField | Command::Rpc
        )
    }
}

/// Bits of the sub-command byte that follows the ioid in requests and responses
pub mod subcommand {
    pub const DEFAULT: u8 = 0x00;
    pub const PROCESS: u8 = 0x04;
    pub const INIT: u8 = 0x08;
    pub const DESTROY: u8 = 0x10;
    pub const GET: u8 = 0x40;

    pub const MONITOR_START: u8 = 0x44;
    pub const MONITOR_STOP: u8 = 0x04;
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::beacon(0, Some(Command::Beacon))]
    #[case::search_response(4, Some(Command::SearchResponse))]
    #[case::get_field(17, Some(Command::GetField))]
    #[case::cancel(21, Some(Command::CancelRequest))]
    #[case::gap(5, None)]
    #[case::unknown(99, None)]
    fn test_from_code(#[case] code: u8, #[case] expected: Option<Command>) {
        assert_eq!(Command::try_from(code).ok(), expected);
    }

    #[rstest]
    #[case::get(Command::Get, true)]
    #[case::rpc(Command::Rpc, true)]
    #[case::get_field(Command::GetField, true)]
    #[case::echo(Command::Echo, false)]
    #[case::message(Command::Message, false)]
    #[case::destroy_channel(Command::DestroyChannel, false)]
    fn test_is_data_response(#[case] command: Command, #[case] expected: bool) {
        assert_eq!(command.is_data_response(), expected);
    }
}
