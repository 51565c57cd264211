//! UTIL subsystem: device info and association table proxies

use crate::codec::ShortList;
use crate::structs::AssocDevice;
use crate::types::{Channels, DeviceState, Eui64, KeyData, NodeRelation, Status};

mt_command! {
    /// Reads the device's addresses, type and state
    sreq GetDeviceInfo(Util, 0x00) {}
    rsp GetDeviceInfoRsp / UtilGetDeviceInfoRsp / GetDeviceInfoRspPattern {
        status: Status,
        ieee: Eui64,
        nwk: u16,
        /// Bitmask of coordinator/router/end-device capability
        device_type: u8,
        device_state: DeviceState,
        assoc_devices: ShortList<u16>,
    }
}

mt_command! {
    /// Stores the channel mask used at the next start
    sreq SetChannels(Util, 0x03) {
        channels: Channels,
    }
    rsp SetChannelsRsp / UtilSetChannelsRsp / SetChannelsRspPattern {
        status: Status,
    }
}

mt_command! {
    /// Stores the pre-configured network key
    sreq SetPreConfigKey(Util, 0x05) {
        pre_config_key: KeyData,
    }
    rsp SetPreConfigKeyRsp / UtilSetPreConfigKeyRsp / SetPreConfigKeyRspPattern {
        status: Status,
    }
}

mt_command! {
    /// Controls the board LEDs; led id 0xFF addresses all of them
    sreq LedControl(Util, 0x0A) {
        led_id: u8,
        on: bool,
    }
    rsp LedControlRsp / UtilLedControlRsp / LedControlRspPattern {
        status: Status,
    }
}

mt_command! {
    /// Proxy for `AssocGetWithAddress()`; the IEEE address is all zeroes
    /// when looking up by short address
    sreq AssocGetWithAddress(Util, 0x4A) {
        ieee: Eui64,
        nwk: u16,
    }
    rsp AssocGetWithAddressRsp / UtilAssocGetWithAddressRsp / AssocGetWithAddressRspPattern {
        device: AssocDevice,
    }
}

mt_command! {
    /// Removes a device from the association table. Only present in
    /// community firmware builds; probe before relying on it.
    sreq AssocRemove(Util, 0x63) {
        ieee: Eui64,
    }
    rsp AssocRemoveRsp / UtilAssocRemoveRsp / AssocRemoveRspPattern {
        status: Status,
    }
}

mt_command! {
    /// Re-adds a device to the association table with a known relation
    sreq AssocAdd(Util, 0x64) {
        nwk: u16,
        ieee: Eui64,
        node_relation: NodeRelation,
    }
    rsp AssocAddRsp / UtilAssocAddRsp / AssocAddRspPattern {
        status: Status,
    }
}
