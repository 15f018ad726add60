use crate::error::*;
use std::{fs, io, path::PathBuf};

pub const RAYGEN_ENTRY: &str = "raygen";
pub const MISS_ENTRY: &str = "miss";
pub const OCCLUSION_MISS_ENTRY: &str = "occlusion_miss";
pub const CLOSEST_HIT_ENTRY: &str = "closest_hit";
pub const TONEMAP_ENTRY: &str = "tonemap";

/// Every entry point a ray tracing pipeline is built from.
pub const PIPELINE_ENTRY_POINTS: [&str; 5] = [
    RAYGEN_ENTRY,
    MISS_ENTRY,
    OCCLUSION_MISS_ENTRY,
    CLOSEST_HIT_ENTRY,
    TONEMAP_ENTRY,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShaderFormat {
    Spirv,
    Dxil,
    /// Names a kernel built into the host device.
    Host,
}

#[derive(Debug, Clone)]
pub struct ShaderBytecode {
    pub entry_point: String,
    pub format: ShaderFormat,
    pub code: Vec<u8>,
}

impl ShaderBytecode {
    /// Little-endian words of a SPIR-V module.
    pub fn spirv_words(&self) -> Result<Vec<u32>> {
        const SPIRV_MAGIC: u32 = 0x0723_0203;
        if self.format != ShaderFormat::Spirv || self.code.len() % 4 != 0 || self.code.len() < 4 {
            return Err(Error::Pipeline(format!("{} is not a SPIR-V module", self.entry_point)));
        }
        let words: Vec<u32> = self
            .code
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        if words[0] != SPIRV_MAGIC {
            return Err(Error::Pipeline(format!("{} has bad SPIR-V magic", self.entry_point)));
        }
        Ok(words)
    }
}

/// Resolves entry point names to compiled bytecode.
pub trait ShaderLibrary {
    fn format(&self) -> ShaderFormat;

    fn load(&self, entry_point: &str) -> Result<ShaderBytecode>;
}

/// Precompiled SPIR-V modules stored as `<dir>/<entry_point>.spv`.
pub struct DirectoryShaderLibrary {
    dir: PathBuf,
}

impl DirectoryShaderLibrary {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl ShaderLibrary for DirectoryShaderLibrary {
    fn format(&self) -> ShaderFormat {
        ShaderFormat::Spirv
    }

    fn load(&self, entry_point: &str) -> Result<ShaderBytecode> {
        let path = self.dir.join(entry_point).with_extension("spv");
        let code = fs::read(&path).map_err(|err| match err.kind() {
            io::ErrorKind::NotFound => Error::MissingShader(format!("{} ({})", entry_point, path.display())),
            _ => Error::Io(err),
        })?;
        Ok(ShaderBytecode {
            entry_point: entry_point.to_owned(),
            format: ShaderFormat::Spirv,
            code,
        })
    }
}

/// Names the kernels built into the host device.
#[derive(Default)]
pub struct HostShaderLibrary;

impl ShaderLibrary for HostShaderLibrary {
    fn format(&self) -> ShaderFormat {
        ShaderFormat::Host
    }

    fn load(&self, entry_point: &str) -> Result<ShaderBytecode> {
        if PIPELINE_ENTRY_POINTS.contains(&entry_point) {
            Ok(ShaderBytecode {
                entry_point: entry_point.to_owned(),
                format: ShaderFormat::Host,
                code: entry_point.as_bytes().to_vec(),
            })
        } else {
            Err(Error::MissingShader(entry_point.to_owned()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_library_entry_points() {
        let library = HostShaderLibrary;
        for entry in PIPELINE_ENTRY_POINTS.iter() {
            let bytecode = library.load(entry).unwrap();
            assert_eq!(bytecode.format, ShaderFormat::Host);
            assert_eq!(bytecode.code, entry.as_bytes());
        }
        assert!(matches!(library.load("any_hit"), Err(Error::MissingShader(_))));
    }

    #[test]
    fn directory_library() {
        let dir = tempfile::tempdir().unwrap();
        let mut module = 0x0723_0203u32.to_le_bytes().to_vec();
        module.extend_from_slice(&[0u8; 16]);
        fs::write(dir.path().join("raygen.spv"), &module).unwrap();
        fs::write(dir.path().join("miss.spv"), &[1u8, 2, 3]).unwrap();

        let library = DirectoryShaderLibrary::new(dir.path());
        let words = library.load(RAYGEN_ENTRY).unwrap().spirv_words().unwrap();
        assert_eq!(words.len(), 5);
        assert!(library.load(MISS_ENTRY).unwrap().spirv_words().is_err());
        assert!(matches!(library.load(TONEMAP_ENTRY), Err(Error::MissingShader(_))));
    }
}
