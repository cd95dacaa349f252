use tracing::{error, info};
use u3stream::transport::list_devices;

fn main() {
    tracing_subscriber::fmt().with_target(false).init();

    info!("Listing connected LabJack U3 devices...");

    match list_devices() {
        Ok(devices) => {
            for (index, device_info) in devices.iter().enumerate() {
                info!(
                    "Device #{}: VID: {:#06x}, PID: {:#06x}, Bus: {:03}, Address: {:03}",
                    index + 1,
                    device_info.vendor_id(),
                    device_info.product_id(),
                    device_info.bus_number(),
                    device_info.device_address()
                );
                info!("  Product: {}", device_info.product_string().unwrap_or("<Not available>"));
                info!("  Serial: {}", device_info.serial_number().unwrap_or("<Not available>"));
                info!("  Speed: {:?}", device_info.speed());
            }
            if devices.is_empty() {
                info!("No U3 found.");
            }
        }
        Err(e) => {
            error!("Error listing USB devices: {}", e);
            std::process::exit(1);
        }
    }
}
