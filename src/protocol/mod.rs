mod codec;
mod command;
mod handshake;
mod kill;
mod packet;
mod reply;

pub use codec::PacketCodec;
pub use command::{rewrite_statement_id, ClientCommand};
pub use handshake::{
    compute_auth_response, stored_hash_for_password, verify_auth_response,
    verify_with_stored_hash, AuthSwitchRequest, HandshakeResponse, InitialHandshake,
};
pub use kill::{KillQuery, KillScope, KillStrength, KillTarget};
pub use packet::{
    capabilities, mariadb_capabilities, split_into_packets, status, Command, Packet,
    PacketAccumulator, AUTH_PACKET_BASE_SIZE, MAX_PACKET_SIZE, PACKET_HEADER_SIZE, SCRAMBLE_SIZE,
};
pub use reply::{
    get_lenenc_int, get_lenenc_str, is_eof_packet, is_err_packet, is_ok_packet, put_lenenc_int,
    put_lenenc_str, EofPacket, ErrPacket, OkPacket, PrepareOk, Reply, ReplyDecoder, ReplyState,
    SessionTrack, TrxState,
};
