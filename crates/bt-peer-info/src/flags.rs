/// `added.f` flag bits exchanged over the PEX extension (BEP 11).
pub const ADDED_F_ENCRYPTION: u8 = 1;
pub const ADDED_F_SEED: u8 = 2;
pub const ADDED_F_UTP: u8 = 4;
pub const ADDED_F_HOLEPUNCH: u8 = 8;
pub const ADDED_F_CONNECTABLE: u8 = 16;
