pub mod dispatch;
pub mod envelope;
pub mod schema;
pub mod schemas;
pub mod units;

/// Routing pair the devices expect on app-originated commands.
pub const DEFAULT_SRC: i32 = 32;
pub const DEFAULT_DEST: i32 = 53;

pub const PLUG_MAX_WATTS_LIMIT: i64 = 2500;

pub mod cmd_func {
    pub const DEFAULT: u32 = 0;
    pub const SMART_PLUG: u32 = 2;
    pub const POWERSTREAM: u32 = 20;
    pub const APP: u32 = 32;
    pub const REPORTS: u32 = 254;
}

pub mod cmd_id {
    // powerstream
    pub const HEARTBEAT: u32 = 1;
    pub const HEARTBEAT_REPLY: u32 = 134;
    pub const SET_PERMANENT_WATTS: u32 = 129;
    pub const SET_SUPPLY_PRIORITY: u32 = 130;
    pub const SET_BAT_LOWER: u32 = 132;
    pub const SET_BAT_UPPER: u32 = 133;
    pub const SET_BRIGHTNESS: u32 = 135;
    pub const APP_SET_VALUE: u32 = 11;

    // smart plug
    pub const PLUG_HEARTBEAT: u32 = 1;
    pub const SET_PLUG_SWITCH: u32 = 129;
    pub const SET_PLUG_BRIGHTNESS: u32 = 130;
    pub const SET_MAX_WATTS: u32 = 137;

    // cmd_func 254
    pub const ENERGY_TOTAL_REPORT: u32 = 32;
}
