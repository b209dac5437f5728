use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;

use anyhow::bail;
use image::{DynamicImage, ImageFormat};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::protocol::tsmp::{PictMode, PSN_SIGNED_IN};
use crate::session::manager::{NetmpLease, NetmpManager};
use crate::session::tsmp::{PictStream, Tsmp};
use crate::wire::record::Variant;


/// System information and power control of a device
pub struct Info {
    lease: Option<NetmpLease>,
    tsmp: Arc<Tsmp>,
}

impl Info {
    pub async fn start(manager: &Arc<NetmpManager>, ip: IpAddr) -> anyhow::Result<Info> {
        let lease = manager.start(ip).await?;
        let tsmp = lease.netmp().register::<Tsmp>().await?;
        Ok(Info {
            lease: Some(lease),
            tsmp,
        })
    }

    pub async fn stop(mut self) -> anyhow::Result<()> {
        if let Some(lease) = self.lease.take() {
            let unregistered = lease.netmp().unregister::<Tsmp>().await;
            lease.release().await?;
            unregistered?;
        }
        Ok(())
    }

    pub async fn is_user_signed_in(&self, username: &str) -> anyhow::Result<bool> {
        let state = self.tsmp.get_psn_state(username).await?;
        Ok(state.result == 0 && state.psn_state == Some(PSN_SIGNED_IN))
    }

    pub async fn get_info(&self) -> anyhow::Result<BTreeMap<String, Variant>> {
        Ok(self.tsmp.get_info().await?
            .into_iter()
            .map(|entry| (entry.name, entry.value))
            .collect())
    }

    pub async fn get_power_status(&self) -> anyhow::Result<u32> {
        self.tsmp.get_power_status().await
    }

    pub async fn reboot(&self) -> anyhow::Result<()> {
        self.tsmp.reboot().await
    }

    pub async fn power_off(&self) -> anyhow::Result<()> {
        self.tsmp.power_off().await
    }

    pub fn pict_blocks(&self, mode: PictMode) -> anyhow::Result<PictStream> {
        self.tsmp.get_pict(mode)
    }

    /// Writes a screenshot to `out` and returns its size in bytes
    pub async fn write_pict<W: AsyncWrite + Unpin>(&self, mode: PictMode, out: &mut W) -> anyhow::Result<usize> {
        let mut blocks = self.pict_blocks(mode)?;
        let mut total = 0;
        while let Some(chunk) = blocks.next_chunk().await? {
            out.write_all(&chunk).await?;
            total += chunk.len();
        }
        out.flush().await?;
        debug!("wrote {} byte screenshot", total);
        Ok(total)
    }

    /// Saves a screenshot to `path`, converting the device's TGA data to PNG or JPEG depending on
    ///  the file extension
    pub async fn save_pict(&self, mode: PictMode, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let path = path.as_ref().to_path_buf();
        let format = ImageFormat::from_path(&path)?;
        if !matches!(format, ImageFormat::Png | ImageFormat::Jpeg) {
            bail!("screenshots can be saved as PNG or JPEG, not {:?}", format);
        }

        let mut tga = Vec::new();
        self.write_pict(mode, &mut tga).await?;

        tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
            let decoded = image::load_from_memory_with_format(&tga, ImageFormat::Tga)?;
            let encoded = match format {
                // no alpha channel in JPEG
                ImageFormat::Jpeg => DynamicImage::ImageRgb8(decoded.to_rgb8()),
                _ => decoded,
            };
            encoded.save_with_format(&path, format)?;
            debug!("saved {}x{} screenshot to {:?}", encoded.width(), encoded.height(), path);
            Ok(())
        }).await?
    }
}


#[cfg(test)]
mod test {
    use std::io::Cursor;
    use bytes::Bytes;
    use image::{Rgb, RgbImage};
    use crate::protocol::tsmp::{POWER_OFF, POWER_REBOOT};
    use crate::test_util::fake_device::{device_ip, info_entry, FakeDevice};
    use crate::test_util::test_config;
    use super::*;

    async fn start(device: &FakeDevice) -> (Arc<NetmpManager>, Info) {
        let manager = NetmpManager::new(test_config("alice"), Arc::new(device.clone()));
        let info = Info::start(&manager, device_ip()).await.unwrap();
        (manager, info)
    }

    #[tokio::test]
    async fn test_info_and_power() {
        let device = FakeDevice::new();
        device.set_info(vec![
            info_entry("model", Variant::Utf8("devkit".to_string())),
            info_entry("fw", Variant::U64(0x1100_0000)),
        ]);
        device.set_power_status(1);
        let (manager, info) = start(&device).await;

        let map = info.get_info().await.unwrap();
        assert_eq!(map.keys().collect::<Vec<_>>(), vec!["fw", "model"]);
        assert_eq!(map["model"], Variant::Utf8("devkit".to_string()));
        assert_eq!(info.get_power_status().await.unwrap(), 1);

        info.reboot().await.unwrap();
        info.power_off().await.unwrap();
        assert_eq!(device.power_requests(), vec![POWER_REBOOT, POWER_OFF]);

        info.stop().await.unwrap();
        assert_eq!(manager.ref_count(device_ip()), 0);
    }

    #[tokio::test]
    async fn test_user_signed_in() {
        let device = FakeDevice::new();
        device.set_psn_state("alice", PSN_SIGNED_IN);
        device.set_psn_state("bob", 1);
        let (_manager, info) = start(&device).await;

        assert!(info.is_user_signed_in("alice").await.unwrap());
        assert!(!info.is_user_signed_in("bob").await.unwrap());
        assert!(!info.is_user_signed_in("nobody").await.unwrap());
        info.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_write_pict() {
        let device = FakeDevice::new();
        device.set_pict(vec![Bytes::from_static(b"\x00\x00\x02"), Bytes::from_static(b"rest of the image")]);
        let (_manager, info) = start(&device).await;

        let mut file = Vec::new();
        let size = info.write_pict(PictMode::System, &mut file).await.unwrap();
        assert_eq!(size, 20);
        assert_eq!(file, b"\x00\x00\x02rest of the image");
        info.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_save_pict_converts_tga() {
        let mut original = RgbImage::new(3, 2);
        for (x, y, pixel) in original.enumerate_pixels_mut() {
            *pixel = Rgb([x as u8 * 80, y as u8 * 120, 200]);
        }
        let mut tga = Vec::new();
        DynamicImage::ImageRgb8(original.clone()).write_to(&mut Cursor::new(&mut tga), ImageFormat::Tga).unwrap();

        let device = FakeDevice::new();
        let (first, rest) = tga.split_at(tga.len() / 2);
        device.set_pict(vec![Bytes::copy_from_slice(first), Bytes::copy_from_slice(rest)]);
        let (_manager, info) = start(&device).await;

        let path = std::env::temp_dir().join(format!("deci4-pict-{}.png", std::process::id()));
        info.save_pict(PictMode::System, &path).await.unwrap();
        let saved = image::open(&path).unwrap().to_rgb8();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(saved, original);
        info.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_save_pict_rejects_other_formats() {
        let device = FakeDevice::new();
        let (_manager, info) = start(&device).await;

        let path = std::env::temp_dir().join(format!("deci4-pict-{}.bmp", std::process::id()));
        assert!(info.save_pict(PictMode::System, &path).await.is_err());
        assert!(!path.exists());
        info.stop().await.unwrap();
    }
}
