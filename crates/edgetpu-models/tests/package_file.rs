//! Package loading from disk

use std::io::Write;

use bytes::Bytes;
use edgetpu_models::{
    DataType, Description, DmaHint, Executable, ExecutableType, Layer, ModelError, OutputLayer,
    OutputLayout, Package,
};

fn stand_alone() -> Executable {
    let mut output = Layer::new("logits", DataType::SignedFixedPoint8, (2, 2, 4));
    output.size_bytes = 32;
    output.layout = Some(OutputLayout {
        y_coordinate_to_linear_tile_id_map: vec![0, 0],
        x_coordinate_to_linear_tile_id_map: vec![0, 1],
        linearized_tile_byte_offset: vec![0, 16],
        x_coordinate_to_local_byte_offset: vec![0, 0],
        y_coordinate_to_local_y_offset: vec![0, 1],
        x_coordinate_to_local_y_row_size: vec![8, 8],
    });
    Executable {
        instruction_bitstreams: vec![Bytes::from(vec![0xC0; 100])],
        parameters: Bytes::from(vec![0x11; 64]),
        dma_hints: vec![
            DmaHint::Instruction { chunk_index: 0 },
            DmaHint::Descriptor {
                desc: Description::Parameter,
                name: String::new(),
                offset: 0,
                size: 64,
            },
            DmaHint::Descriptor {
                desc: Description::InputActivation,
                name: "image".into(),
                offset: 0,
                size: 12,
            },
            DmaHint::Descriptor {
                desc: Description::OutputActivation,
                name: "logits".into(),
                offset: 0,
                size: 32,
            },
        ],
        input_layers: vec![Layer::new("image", DataType::FixedPoint8, (2, 2, 3))],
        output_layers: vec![output],
        executable_type: ExecutableType::StandAlone,
        parameter_caching_token: 0,
    }
}

#[test]
fn test_package_from_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(&Package::encode(&[stand_alone()])).unwrap();

    let package = Package::from_file(file.path()).unwrap();
    assert!(package.parameter_caching().is_none());
    let exe = package.inference();
    assert_eq!(exe, &stand_alone());

    let output = OutputLayer::new(&exe.output_layers[0]).unwrap();
    assert_eq!(output.scratch().len(), 32);
    assert_eq!(output.dense_size_bytes(), 16);
}

#[test]
fn test_missing_file() {
    let dir = tempfile::tempdir().unwrap();
    let result = Package::from_file(dir.path().join("absent.bin"));
    assert!(matches!(result, Err(ModelError::FileNotFound { .. })));
}

#[test]
fn test_truncated_file_is_an_error() {
    let encoded = Package::encode(&[stand_alone()]);
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(&encoded[..encoded.len() / 3]).unwrap();
    assert!(Package::from_file(file.path()).is_err());
}
