//! Supported input formats.
//!
//! The allow-list is the union of the format families the conversion engine
//! understands. Lists are kept in declaration order, duplicates included, so
//! `/get_supported_file_types` reports exactly what is declared here.

/// One family of formats the engine can read or write.
#[derive(Debug, Clone, Copy)]
pub struct FormatFamily {
    pub name: &'static str,
    pub inputs: &'static [&'static str],
    pub outputs: &'static [&'static str],
}

pub const DOCUMENT: FormatFamily = FormatFamily {
    name: "document",
    inputs: &[
        ".odt", ".doc", ".docx", ".docm", ".rtf", ".txt", ".html", ".htm", ".xml", ".wps", ".wpd",
        ".lwp", ".sdw", ".sxw",
    ],
    outputs: &[
        ".odt", ".doc", ".docx", ".rtf", ".txt", ".html", ".pdf", ".epub", ".xml",
    ],
};

pub const SPREADSHEET: FormatFamily = FormatFamily {
    name: "spreadsheet",
    inputs: &[
        ".ods", ".xls", ".xlsx", ".xlsm", ".csv", ".tsv", ".dif", ".sylk", ".wk1", ".wks", ".123",
        ".sdc", ".sxc",
    ],
    outputs: &[".ods", ".xls", ".xlsx", ".csv", ".html", ".pdf", ".xml"],
};

pub const PRESENTATION: FormatFamily = FormatFamily {
    name: "presentation",
    inputs: &[".odp", ".ppt", ".pptx", ".pptm", ".sdd", ".sxi"],
    outputs: &[".odp", ".ppt", ".pptx", ".pdf", ".html", ".swf"],
};

pub const DRAWING: FormatFamily = FormatFamily {
    name: "drawing",
    inputs: &[".odg", ".vsd", ".vsdx", ".wmf", ".emf", ".svg", ".sda", ".sxd"],
    outputs: &[".odg", ".pdf", ".svg", ".png", ".jpg", ".jpeg", ".bmp"],
};

pub const DATABASE: FormatFamily = FormatFamily {
    name: "database",
    inputs: &[".odb", ".mdb", ".accdb", ".csv"],
    outputs: &[".odb", ".csv", ".pdf"],
};

pub const FORMULA: FormatFamily = FormatFamily {
    name: "formula",
    inputs: &[".odf", ".mml"],
    outputs: &[".odf", ".mml", ".pdf"],
};

pub const FAMILIES: [FormatFamily; 6] =
    [DOCUMENT, SPREADSHEET, PRESENTATION, DRAWING, DATABASE, FORMULA];

/// Read-only allow-list shared by every job.
#[derive(Debug, Clone)]
pub struct SupportedFormats {
    extensions: Vec<&'static str>,
}

impl SupportedFormats {
    /// The full engine allow-list.
    pub fn standard() -> Self {
        let extensions = FAMILIES
            .iter()
            .flat_map(|f| f.inputs.iter().chain(f.outputs.iter()).copied())
            .collect();
        Self { extensions }
    }

    /// Every declared extension, in declaration order.
    pub fn extensions(&self) -> &[&'static str] {
        &self.extensions
    }

    /// Case-insensitive membership test; the leading dot is optional.
    pub fn is_supported(&self, ext: &str) -> bool {
        let normalized = normalize_extension(ext);
        self.extensions.iter().any(|e| *e == normalized)
    }
}

impl Default for SupportedFormats {
    fn default() -> Self {
        Self::standard()
    }
}

/// Output format of every conversion. Inputs with it are rejected.
pub const PDF_EXTENSION: &str = ".pdf";

/// Whether `ext` names a PDF, in any case, with or without the dot.
pub fn is_pdf(ext: &str) -> bool {
    normalize_extension(ext) == PDF_EXTENSION
}

/// Lowercase with a single leading dot.
pub fn normalize_extension(ext: &str) -> String {
    format!(".{}", ext.trim().trim_start_matches('.').to_lowercase())
}

/// Name of the family an extension is first declared in, for display.
pub fn family_of(ext: &str) -> Option<&'static str> {
    let normalized = normalize_extension(ext);
    FAMILIES
        .iter()
        .find(|f| f.inputs.contains(&normalized.as_str()))
        .map(|f| f.name)
}
