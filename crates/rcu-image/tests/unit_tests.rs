//! Unit tests for catalog types

mod version_tests {
    use rcu_image::prelude::*;

    #[test]
    fn test_pack_ordering() {
        assert!(SoftwareVersion::new(1, 2, 3, 4).packed() < SoftwareVersion::new(1, 2, 3, 5).packed());
        assert!(SoftwareVersion::new(2, 0, 0, 0) > SoftwareVersion::new(1, 255, 255, 255));
    }

    #[test]
    fn test_hardware_minimum_lot_ignored() {
        let min = HardwareVersion::new(1, 2, 3, 200);
        assert!(HardwareVersion::new(1, 2, 3, 0).meets_minimum(&min));
    }

    #[test]
    fn test_hardware_parse_rejects_manufacturer() {
        assert!(matches!(
            HardwareVersion::parse("16.0.0.0"),
            Err(ImageError::InvalidVersion { .. })
        ));
    }
}

mod descriptor_tests {
    use rcu_image::descriptor::{TagReader, XmlTagReader, parse_descriptor};
    use rcu_image::prelude::*;
    use std::path::Path;

    const THEMED: &str = "<image><productName>XR16-40</productName><type>AUDIO_DATA_1</type>\
        <version>1.0.0.7</version><bootloaderVersionMin>0.0.0.0</bootloaderVersionMin>\
        <hwVersionMin>3.1.0.0</hwVersionMin><fileName>theme.bin</fileName><size>512</size>\
        <crc>77</crc><audioTheme>2</audioTheme><suppressImmediateLoad>1</suppressImmediateLoad></image>";

    #[test]
    fn test_optional_fields() -> ImageResult<()> {
        let d = parse_descriptor(THEMED, &XmlTagReader, Path::new("theme.xml"))?;
        assert_eq!(d.image_type, ImageType::AudioData1);
        assert_eq!(d.audio_theme, AudioTheme(2));
        assert!(d.suppress_immediate_load);
        assert!(!d.force_update);
        assert_eq!(d.crc, 77);
        Ok(())
    }

    #[test]
    fn test_bad_flag_rejected() {
        let xml = THEMED.replace("<suppressImmediateLoad>1", "<suppressImmediateLoad>maybe");
        assert!(parse_descriptor(&xml, &XmlTagReader, Path::new("theme.xml")).is_err());
    }

    #[test]
    fn test_nested_file_name_rejected() {
        let xml = THEMED.replace("theme.bin", "../theme.bin");
        assert!(parse_descriptor(&xml, &XmlTagReader, Path::new("theme.xml")).is_err());
    }

    #[test]
    fn test_tag_reader_first_match() {
        let xml = "<root><v>1</v><v>2</v></root>";
        assert_eq!(XmlTagReader.read_tag(xml, "v").as_deref(), Some("1"));
        assert_eq!(XmlTagReader.read_tag("<root><v>", "v"), None);
    }
}
