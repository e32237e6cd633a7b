//! Device profiles the client can present itself as.
//!
//! The device decides the `user-agent` and `x-line-application` headers.

use std::fmt;
use std::str::FromStr;

/// A supported client device type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Device {
    DesktopWin,
    DesktopMac,
    Ios,
    IosIpad,
    Android,
    AndroidSecondary,
    WatchOs,
    WearOs,
}

/// Version and system strings of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceDetails {
    pub app_version: &'static str,
    pub system_name: &'static str,
    pub system_version: &'static str,
}

impl Device {
    pub const ALL: [Device; 8] = [
        Device::DesktopWin,
        Device::DesktopMac,
        Device::Ios,
        Device::IosIpad,
        Device::Android,
        Device::AndroidSecondary,
        Device::WatchOs,
        Device::WearOs,
    ];

    /// Upper-case application type name sent to the server.
    pub fn name(self) -> &'static str {
        match self {
            Device::DesktopWin => "DESKTOPWIN",
            Device::DesktopMac => "DESKTOPMAC",
            Device::Ios => "IOS",
            Device::IosIpad => "IOSIPAD",
            Device::Android => "ANDROID",
            Device::AndroidSecondary => "ANDROIDSECONDARY",
            Device::WatchOs => "WATCHOS",
            Device::WearOs => "WEAROS",
        }
    }

    pub fn details(self) -> DeviceDetails {
        let (app_version, system_name, system_version) = match self {
            Device::DesktopWin => ("9.2.0.3403", "WINDOWS", "10.0.0-NT-x64"),
            Device::DesktopMac => ("9.2.0.3403", "MAC", "14.0.0-MacOSX-arm64"),
            Device::Ios | Device::IosIpad => ("15.19.0", "iOS", "18.0"),
            Device::Android | Device::AndroidSecondary => ("14.21.0", "Android OS", "12"),
            Device::WatchOs => ("15.19.0", "watchOS", "11.0"),
            Device::WearOs => ("3.3.0", "Wear OS", "4.0"),
        };
        DeviceDetails {
            app_version,
            system_name,
            system_version,
        }
    }

    /// Whether the device can use the v3 (refreshable token) login.
    pub fn supports_v3_token(self) -> bool {
        matches!(
            self,
            Device::DesktopWin
                | Device::DesktopMac
                | Device::Ios
                | Device::Android
                | Device::AndroidSecondary
        )
    }

    /// `x-line-application` header value.
    pub fn application_header(self, app_version: &str) -> String {
        let details = self.details();
        format!(
            "{}\t{}\t{}\t{}",
            self.name(),
            app_version,
            details.system_name,
            details.system_version
        )
    }

    /// `user-agent` header value.
    pub fn user_agent(self, app_version: &str) -> String {
        format!("Line/{}", app_version)
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Device {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.to_ascii_uppercase();
        Device::ALL
            .into_iter()
            .find(|d| d.name() == upper)
            .ok_or_else(|| format!("unknown device type: {}", s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_all_names() {
        for device in Device::ALL {
            assert_eq!(device.name().parse::<Device>().unwrap(), device);
        }
        assert_eq!("desktopmac".parse::<Device>().unwrap(), Device::DesktopMac);
        assert!("FRIDGE".parse::<Device>().is_err());
    }

    #[test]
    fn test_application_header() {
        let header = Device::DesktopWin.application_header("9.2.0.3403");
        assert_eq!(header, "DESKTOPWIN\t9.2.0.3403\tWINDOWS\t10.0.0-NT-x64");
        assert_eq!(
            Device::Android.application_header("1.0"),
            "ANDROID\t1.0\tAndroid OS\t12"
        );
    }

    #[test]
    fn test_user_agent() {
        assert_eq!(Device::Ios.user_agent("15.19.0"), "Line/15.19.0");
    }

    #[test]
    fn test_v3_support() {
        assert!(Device::DesktopWin.supports_v3_token());
        assert!(Device::AndroidSecondary.supports_v3_token());
        assert!(!Device::IosIpad.supports_v3_token());
        assert!(!Device::WearOs.supports_v3_token());
    }

    #[test]
    fn test_details() {
        let details = Device::WearOs.details();
        assert_eq!(details.app_version, "3.3.0");
        assert_eq!(details.system_name, "Wear OS");
    }
}
