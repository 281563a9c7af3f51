//! Supported instrument models
//!
//! Each model names the USB identity the instrument reports once its
//! firmware is running, the identity it enumerates with before firmware
//! upload, and the endpoints its data interface exposes.

/// Bulk-IN endpoint of the instrument's data interface
pub const EP_IN: u8 = 0x86;
/// Bulk-OUT endpoint of the instrument's data interface
pub const EP_OUT: u8 = 0x02;
/// Minimum firmware release (bcdDevice) for normal operation
pub const FIRMWARE_VERSION: u16 = 0x0210;

const VID_FIRMWARE: u16 = 0x04B5;
const VID_NO_FIRMWARE: u16 = 0x04B4;

/// Static description of one instrument model
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceModel {
    pub name: &'static str,
    pub vendor_id: u16,
    pub product_id: u16,
    pub vendor_id_no_firmware: u16,
    pub product_id_no_firmware: u16,
    pub firmware_version: u16,
    pub endpoint_in: u8,
    pub endpoint_out: u8,
    /// Software-only stand-in without hardware
    pub demo: bool,
}

impl DeviceModel {
    const fn hantek(name: &'static str, product_id: u16) -> Self {
        Self {
            name,
            vendor_id: VID_FIRMWARE,
            product_id,
            vendor_id_no_firmware: VID_NO_FIRMWARE,
            product_id_no_firmware: product_id,
            firmware_version: FIRMWARE_VERSION,
            endpoint_in: EP_IN,
            endpoint_out: EP_OUT,
            demo: false,
        }
    }

    /// Whether a device reporting these IDs is an instance of this model,
    /// with or without firmware loaded
    pub fn matches(&self, vendor_id: u16, product_id: u16) -> bool {
        (vendor_id == self.vendor_id && product_id == self.product_id)
            || (vendor_id == self.vendor_id_no_firmware
                && product_id == self.product_id_no_firmware)
    }
}

pub static DSO_6022BE: DeviceModel = DeviceModel::hantek("DSO-6022BE", 0x6022);
pub static DSO_6022BL: DeviceModel = DeviceModel::hantek("DSO-6022BL", 0x602A);
pub static DSO_6021: DeviceModel = DeviceModel::hantek("DSO-6021", 0x6021);
pub static DSO_2020: DeviceModel = DeviceModel::hantek("DSO-2020", 0x2020);

pub static DEMO: DeviceModel = DeviceModel {
    name: "DEMO",
    vendor_id: 0,
    product_id: 0,
    vendor_id_no_firmware: 0,
    product_id_no_firmware: 0,
    firmware_version: 0,
    endpoint_in: EP_IN,
    endpoint_out: EP_OUT,
    demo: true,
};

static MODELS: [&DeviceModel; 4] = [&DSO_6022BE, &DSO_6022BL, &DSO_6021, &DSO_2020];

/// All hardware models, in lookup order
pub fn models() -> &'static [&'static DeviceModel] {
    &MODELS
}

/// First model matching the reported IDs
///
/// Several models may share IDs; the first one in registry order wins.
pub fn find_model(vendor_id: u16, product_id: u16) -> Option<&'static DeviceModel> {
    MODELS
        .iter()
        .copied()
        .find(|model| model.matches(vendor_id, product_id))
}

/// Look up a model by name, ignoring case
pub fn find_model_by_name(name: &str) -> Option<&'static DeviceModel> {
    if DEMO.name.eq_ignore_ascii_case(name) {
        return Some(&DEMO);
    }
    MODELS
        .iter()
        .copied()
        .find(|model| model.name.eq_ignore_ascii_case(name))
}
