//! Compiled-in payload tables for the binary device families.

use std::sync::Arc;

use super::schema::{DerivedFieldSpec, FieldDescriptor, FieldKind, NodeSpec, PayloadSchema};

use FieldKind::{Bool, Int, Message, UInt};

fn field(tag: u32, name: &str, kind: FieldKind) -> FieldDescriptor {
    FieldDescriptor::new(tag, name, kind)
}

/// Single-value payload used for several inverter set commands and their echo.
pub fn set_value() -> Arc<PayloadSchema> {
    Arc::new(PayloadSchema::new("SetValue", vec![field(1, "value", Int)]))
}

fn single(name: &str, field_name: &str) -> Arc<PayloadSchema> {
    Arc::new(PayloadSchema::new(name, vec![field(1, field_name, Int)]))
}

pub fn permanent_watts_pack() -> Arc<PayloadSchema> {
    single("PermanentWattsPack", "permanentWatts")
}

pub fn bat_lower_pack() -> Arc<PayloadSchema> {
    single("BatLowerPack", "lowerLimit")
}

pub fn bat_upper_pack() -> Arc<PayloadSchema> {
    single("BatUpperPack", "upperLimit")
}

pub fn brightness_pack() -> Arc<PayloadSchema> {
    single("BrightnessPack", "brightness")
}

pub fn plug_switch_pack() -> Arc<PayloadSchema> {
    single("PlugSwitchPack", "plugSwitch")
}

pub fn max_watts_pack() -> Arc<PayloadSchema> {
    single("MaxWattsPack", "maxWatts")
}

pub fn inverter_heartbeat() -> Arc<PayloadSchema> {
    let fields = vec![
        field(1, "invErrCode", UInt),
        field(2, "pv1ErrCode", UInt),
        field(3, "invWarnCode", UInt),
        field(4, "pv1WarnCode", UInt),
        field(5, "pv2ErrCode", UInt),
        field(6, "pv2WarningCode", UInt),
        field(7, "batErrCode", UInt),
        field(8, "batWarningCode", UInt),
        field(9, "llcErrCode", UInt),
        field(10, "llcWarningCode", UInt),
        field(11, "pv1Statue", UInt),
        field(12, "pv2Statue", UInt),
        field(13, "batStatue", UInt),
        field(14, "llcStatue", UInt),
        field(15, "invStatue", UInt),
        field(16, "pv1InputVolt", Int).node("pv1").display_name("PV1 input voltage"),
        field(17, "pv1OpVolt", Int).node("pv1").display_name("PV1 operating voltage"),
        field(18, "pv1InputCur", Int).node("pv1").display_name("PV1 input current"),
        field(19, "pv1InputWatts", Int).node("pv1").display_name("PV1 input"),
        field(20, "pv1Temp", Int).node("pv1").display_name("PV1 temperature"),
        field(21, "pv2InputVolt", Int).node("pv2").display_name("PV2 input voltage"),
        field(22, "pv2OpVolt", Int).node("pv2").display_name("PV2 operating voltage"),
        field(23, "pv2InputCur", Int).node("pv2").display_name("PV2 input current"),
        field(24, "pv2InputWatts", Int).node("pv2").display_name("PV2 input"),
        field(25, "pv2Temp", Int).node("pv2").display_name("PV2 temperature"),
        field(26, "batInputVolt", Int).node("battery").display_name("Battery voltage"),
        field(27, "batOpVolt", Int).node("battery").display_name("Battery operating voltage"),
        field(28, "batInputCur", Int).node("battery").display_name("Battery current"),
        field(29, "batInputWatts", Int).node("battery").display_name("Battery power"),
        field(30, "batTemp", Int).node("battery").display_name("Battery temperature"),
        field(31, "batSoc", UInt).node("battery").display_name("Battery level"),
        field(32, "llcInputVolt", Int),
        field(33, "llcOpVolt", Int),
        field(34, "llcTemp", Int).node("inverter").display_name("LLC temperature"),
        field(35, "invInputVolt", Int).node("inverter").display_name("Inverter input voltage"),
        field(36, "invOpVolt", Int).node("inverter").display_name("Grid voltage"),
        field(37, "invOutputCur", Int).node("inverter").display_name("Inverter output current"),
        field(38, "invOutputWatts", Int).node("inverter").display_name("Inverter output"),
        field(39, "invTemp", Int).node("inverter").display_name("Inverter temperature"),
        field(40, "invFreq", Int)
            .node("inverter")
            .unit("Hz")
            .divisor(10)
            .display_name("Grid frequency"),
        field(41, "invDcCur", Int),
        field(42, "bpType", Int),
        field(43, "invRelayStatus", Int),
        field(44, "pv1RelayStatus", Int),
        field(45, "pv2RelayStatus", Int),
        field(46, "installCountry", UInt),
        field(47, "installTown", UInt),
        field(48, "permanentWatts", UInt)
            .node("settings")
            .settable()
            .display_name("Permanent watts"),
        field(49, "dynamicWatts", UInt).node("inverter").display_name("Dynamic watts"),
        field(50, "supplyPriority", UInt)
            .node("settings")
            .settable()
            .display_name("Supply priority"),
        field(51, "lowerLimit", UInt)
            .node("settings")
            .settable()
            .display_name("Battery lower limit"),
        field(52, "upperLimit", UInt)
            .node("settings")
            .settable()
            .display_name("Battery upper limit"),
        field(53, "invOnOff", UInt),
        field(54, "wirelessErrCode", UInt),
        field(55, "wirelessWarnCode", UInt),
        field(56, "invBrightness", UInt)
            .node("settings")
            .settable()
            .display_name("LED brightness"),
        field(57, "heartbeatFrequency", UInt),
        field(58, "ratedPower", UInt).node("inverter").display_name("Rated power"),
    ];

    Arc::new(
        PayloadSchema::new("InverterHeartbeat", fields)
            .with_nodes(vec![
                NodeSpec::new("pv1", "PV1"),
                NodeSpec::new("pv2", "PV2"),
                NodeSpec::new("pv", "PV total").no_retain(),
                NodeSpec::new("battery", "Battery"),
                NodeSpec::new("inverter", "Inverter"),
                NodeSpec::new("settings", "Settings"),
            ])
            .with_derived(vec![DerivedFieldSpec::sum(
                "pvInputWatts",
                "pv",
                &["pv1InputWatts", "pv2InputWatts"],
                "W",
            )]),
    )
}

/// Daily energy counters reported by the inverter (function 254).
pub fn energy_total_report() -> Arc<PayloadSchema> {
    let item = Arc::new(PayloadSchema::new(
        "EnergyItem",
        vec![
            field(1, "timestamp", UInt),
            field(2, "timezone", Int),
            field(3, "watthType", UInt),
            field(4, "watth", UInt).repeated(),
        ],
    ));
    Arc::new(PayloadSchema::new(
        "EnergyTotalReport",
        vec![
            field(1, "watthType", UInt),
            field(2, "watthItem", Message(item)),
        ],
    ))
}

/// Properties computed from energy reports rather than decoded directly.
pub fn energy_totals() -> Arc<PayloadSchema> {
    let total = |tag, name: &str, display: &str| {
        field(tag, name, Int).node("energy").unit("Wh").display_name(display)
    };
    Arc::new(
        PayloadSchema::new(
            "EnergyTotals",
            vec![
                total(1, "todayTotal", "Today total"),
                total(2, "todayFromBattery", "Today from battery"),
                total(3, "todayFromSolar", "Today from solar"),
            ],
        )
        .with_nodes(vec![NodeSpec::new("energy", "Energy")]),
    )
}

pub fn plug_heartbeat() -> Arc<PayloadSchema> {
    let fields = vec![
        field(1, "errCode", UInt),
        field(2, "warnCode", UInt),
        field(3, "country", UInt),
        field(4, "town", UInt),
        field(5, "maxCur", UInt).node("plug").display_name("Maximum current"),
        field(6, "temp", Int).node("plug").display_name("Temperature"),
        field(7, "freq", UInt).node("plug").unit("Hz").display_name("Frequency"),
        field(8, "current", UInt)
            .node("plug")
            .unit("A")
            .divisor(1000)
            .display_name("Current"),
        field(9, "volt", UInt).node("plug").display_name("Voltage"),
        field(10, "watts", UInt).node("plug").display_name("Power"),
        field(11, "switch", Bool).node("plug").settable().display_name("Switch"),
        field(12, "brightness", UInt)
            .node("plug")
            .unit("")
            .divisor(1)
            .settable()
            .display_name("LED brightness"),
        field(13, "maxWatts", UInt)
            .node("plug")
            .unit("W")
            .divisor(1)
            .settable()
            .display_name("Maximum watts"),
        field(14, "heartbeatFrequency", UInt),
        field(15, "meshEnable", UInt),
    ];
    Arc::new(
        PayloadSchema::new("PlugHeartbeat", fields).with_nodes(vec![NodeSpec::new("plug", "Plug")]),
    )
}
