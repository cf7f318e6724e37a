//! The XML file list (`files.xml.bz2`) exchanged between peers.

use crate::{
    error::{Error, Result},
    tiger::TigerHash,
};
use bzip2::{read::BzDecoder, write::BzEncoder, Compression};
use quick_xml::{
    events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event},
    Reader, Writer,
};
use std::io::{Read, Write};

const INDENT: usize = 4;

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct FileList {
    pub version: String,
    pub cid: String,
    pub base: String,
    pub generator: String,
    /// Unnamed top level holding the shared roots.
    pub root: FileListDirectory,
}

#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub struct FileListDirectory {
    pub name: String,
    pub directories: Vec<FileListDirectory>,
    pub files: Vec<FileListFile>,
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct FileListFile {
    pub name: String,
    pub size: u64,
    pub tth: TigerHash,
}

impl FileList {
    pub fn from_bz2(bytes: &[u8]) -> Result<Self> {
        let xml = decompress(bytes)?;
        let xml = String::from_utf8(xml)
            .map_err(|_| Error::FileList("file list is not valid UTF-8".to_owned()))?;
        Self::parse(&xml)
    }

    pub fn parse(xml: &str) -> Result<Self> {
        let mut reader = Reader::from_str(xml);
        reader.trim_text(true);

        let mut list: Option<FileList> = None;
        // Directories being filled, innermost last. The first entry is the root.
        let mut stack: Vec<FileListDirectory> = Vec::new();

        loop {
            let event = reader.read_event().map_err(xml_error)?;

            match event {
                Event::Start(ref element) | Event::Empty(ref element) => {
                    let empty = matches!(event, Event::Empty(_));

                    match element.name().as_ref() {
                        b"FileListing" => {
                            list = Some(FileList {
                                version: attribute(element, b"Version")?.unwrap_or_default(),
                                cid: attribute(element, b"CID")?.unwrap_or_default(),
                                base: attribute(element, b"Base")?.unwrap_or_default(),
                                generator: attribute(element, b"Generator")?
                                    .unwrap_or_default(),
                                root: FileListDirectory::default(),
                            });
                            stack.push(FileListDirectory::default());
                        }
                        b"Directory" => {
                            let directory = FileListDirectory {
                                name: required(element, b"Name")?,
                                ..FileListDirectory::default()
                            };
                            if empty {
                                current(&mut stack)?.directories.push(directory);
                            } else {
                                stack.push(directory);
                            }
                        }
                        b"File" => {
                            let file = FileListFile {
                                name: required(element, b"Name")?,
                                size: required(element, b"Size")?
                                    .parse()
                                    .map_err(|_| Error::FileList("invalid file size".into()))?,
                                tth: required(element, b"TTH")?
                                    .parse()
                                    .map_err(|_| Error::FileList("invalid file TTH".into()))?,
                            };
                            current(&mut stack)?.files.push(file);
                        }
                        other => {
                            return Err(Error::FileList(format!(
                                "unexpected element {}",
                                String::from_utf8_lossy(other)
                            )))
                        }
                    }
                }
                Event::End(element) => match element.name().as_ref() {
                    b"Directory" => {
                        if stack.len() < 2 {
                            return Err(Error::FileList("unbalanced directory".into()));
                        }
                        let directory = stack.pop().unwrap_or_default();
                        current(&mut stack)?.directories.push(directory);
                    }
                    b"FileListing" => {
                        let root = stack.pop().unwrap_or_default();
                        if let Some(list) = list.as_mut() {
                            list.root = root;
                        }
                    }
                    _ => (),
                },
                Event::Eof => break,
                _ => (),
            }
        }

        list.ok_or_else(|| Error::FileList("missing FileListing element".into()))
    }

    /// Renders the canonical form: a prolog line then four-space indented elements.
    pub fn to_xml(&self) -> Result<String> {
        let mut writer = Writer::new_with_indent(Vec::new(), b' ', INDENT);

        writer
            .write_event(Event::Decl(BytesDecl::new("1.0", Some("utf-8"), Some("yes"))))
            .map_err(xml_error)?;
        writer
            .write_event(Event::Start(BytesStart::new("FileListing").with_attributes([
                ("Version", self.version.as_str()),
                ("CID", self.cid.as_str()),
                ("Base", self.base.as_str()),
                ("Generator", self.generator.as_str()),
            ])))
            .map_err(xml_error)?;
        write_contents(&mut writer, &self.root).map_err(xml_error)?;
        writer
            .write_event(Event::End(BytesEnd::new("FileListing")))
            .map_err(xml_error)?;

        String::from_utf8(writer.into_inner())
            .map_err(|_| Error::FileList("file list is not valid UTF-8".to_owned()))
    }

    pub fn to_bz2(&self) -> Result<Vec<u8>> {
        compress(self.to_xml()?.as_bytes())
    }

    /// Finds a directory by its `/`-separated path, e.g. `/share/folder`.
    pub fn find_directory(&self, path: &str) -> Option<&FileListDirectory> {
        let mut directory = &self.root;

        for name in path.split('/').filter(|name| !name.is_empty()) {
            directory = directory
                .directories
                .iter()
                .find(|child| child.name == name)?;
        }

        Some(directory)
    }

    pub fn find_file(&self, path: &str) -> Option<&FileListFile> {
        let path = path.trim_end_matches('/');
        let (parent, name) = path.rsplit_once('/').unwrap_or(("", path));
        self.find_directory(parent)?
            .files
            .iter()
            .find(|file| file.name == name)
    }
}

impl FileListDirectory {
    /// Every file below this directory, with its path relative to it.
    pub fn walk(&self) -> Vec<(String, &FileListFile)> {
        let mut out = Vec::new();
        self.walk_into("", &mut out);
        out
    }

    fn walk_into<'a>(&'a self, prefix: &str, out: &mut Vec<(String, &'a FileListFile)>) {
        for file in &self.files {
            out.push((format!("{}{}", prefix, file.name), file));
        }

        for directory in &self.directories {
            directory.walk_into(&format!("{}{}/", prefix, directory.name), out);
        }
    }
}

fn write_contents(
    writer: &mut Writer<Vec<u8>>,
    directory: &FileListDirectory,
) -> quick_xml::Result<()> {
    for child in &directory.directories {
        writer.write_event(Event::Start(
            BytesStart::new("Directory").with_attributes([("Name", child.name.as_str())]),
        ))?;
        write_contents(writer, child)?;
        writer.write_event(Event::End(BytesEnd::new("Directory")))?;
    }

    for file in &directory.files {
        let size = file.size.to_string();
        let tth = file.tth.to_string();

        writer.write_event(Event::Start(BytesStart::new("File").with_attributes([
            ("Name", file.name.as_str()),
            ("Size", size.as_str()),
            ("TTH", tth.as_str()),
        ])))?;
        // Keeps the closing tag on the same line.
        writer.write_event(Event::Text(BytesText::new("")))?;
        writer.write_event(Event::End(BytesEnd::new("File")))?;
    }

    Ok(())
}

fn current(stack: &mut [FileListDirectory]) -> Result<&mut FileListDirectory> {
    stack
        .last_mut()
        .ok_or_else(|| Error::FileList("element outside FileListing".into()))
}

fn attribute(element: &BytesStart, name: &[u8]) -> Result<Option<String>> {
    for attribute in element.attributes() {
        let attribute = attribute.map_err(|error| Error::FileList(error.to_string()))?;
        if attribute.key.as_ref() == name {
            let value = attribute.unescape_value().map_err(xml_error)?;
            return Ok(Some(value.into_owned()));
        }
    }

    Ok(None)
}

fn required(element: &BytesStart, name: &[u8]) -> Result<String> {
    attribute(element, name)?.ok_or_else(|| {
        Error::FileList(format!(
            "missing attribute {}",
            String::from_utf8_lossy(name)
        ))
    })
}

fn xml_error(error: quick_xml::Error) -> Error {
    Error::FileList(error.to_string())
}

pub(crate) fn compress(bytes: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = BzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(bytes)?;
    Ok(encoder.finish()?)
}

pub(crate) fn decompress(bytes: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    BzDecoder::new(bytes)
        .read_to_end(&mut out)
        .map_err(|error| Error::FileList(format!("invalid bzip2 data: {}", error)))?;
    Ok(out)
}

// ----------------------------------------------------------------------------//

#[cfg(test)]
mod tests {
    use super::*;

    const CANONICAL: &str = r#"<?xml version="1.0" encoding="utf-8" standalone="yes"?>
<FileListing Version="1" CID="testcid" Base="/" Generator="testgen">
    <Directory Name="share">
        <File Name="file 1" Size="30" TTH="UJUIOGYVALWRB56PRJEB6ZH3G4OLTELOEQ3UKMY"></File>
        <File Name="file 2" Size="30" TTH="UJUIOGYVALWRB56PRJEB6ZH3G4OLTELOEQ3UKMY"></File>
    </Directory>
</FileListing>"#;

    #[test]
    fn canonical_form_is_stable() {
        let list = FileList::parse(CANONICAL).unwrap();

        assert_eq!(list.cid, "testcid");
        assert_eq!(list.generator, "testgen");
        assert_eq!(list.root.directories.len(), 1);
        assert_eq!(list.root.directories[0].files.len(), 2);
        assert_eq!(list.to_xml().unwrap(), CANONICAL);
    }

    #[test]
    fn nested_directories_and_lookup() {
        let xml = r#"<?xml version="1.0" encoding="utf-8" standalone="yes"?>
<FileListing Version="1" CID="x" Base="/" Generator="g">
    <Directory Name="share">
        <Directory Name="folder">
            <Directory Name="empty"/>
            <File Name="a &amp; b" Size="1" TTH="LWPNACQDBZRYXW3VHJVCJ64QBZNGHOHHHZWCLNQ"/>
        </Directory>
        <File Name="top" Size="2" TTH="LWPNACQDBZRYXW3VHJVCJ64QBZNGHOHHHZWCLNQ"/>
    </Directory>
</FileListing>"#;

        let list = FileList::parse(xml).unwrap();
        let folder = list.find_directory("/share/folder").unwrap();

        assert_eq!(folder.directories[0].name, "empty");
        assert_eq!(folder.files[0].name, "a & b");
        assert_eq!(list.find_file("/share/top").unwrap().size, 2);
        assert!(list.find_directory("/share/missing").is_none());

        let names: Vec<String> = list
            .find_directory("/share")
            .unwrap()
            .walk()
            .into_iter()
            .map(|(path, _)| path)
            .collect();
        assert_eq!(names, vec!["top", "folder/a & b"]);

        assert!(list.to_xml().unwrap().contains(r#"<File Name="a &amp; b" Size="1""#));
    }

    #[test]
    fn bz2_wrapping() {
        let list = FileList::parse(CANONICAL).unwrap();
        let packed = list.to_bz2().unwrap();

        assert_eq!(FileList::from_bz2(&packed).unwrap(), list);
        assert!(FileList::from_bz2(b"not bzip2").is_err());
    }

    #[test]
    fn empty_directories_and_escaped_names_render() {
        let list = FileList {
            version: "1".into(),
            cid: "x".into(),
            base: "/".into(),
            generator: "<gen>".into(),
            root: FileListDirectory {
                name: String::new(),
                directories: vec![FileListDirectory {
                    name: "\"quoted\"".into(),
                    ..FileListDirectory::default()
                }],
                files: Vec::new(),
            },
        };

        let xml = list.to_xml().unwrap();

        assert_eq!(
            xml,
            r#"<?xml version="1.0" encoding="utf-8" standalone="yes"?>
<FileListing Version="1" CID="x" Base="/" Generator="&lt;gen&gt;">
    <Directory Name="&quot;quoted&quot;">
    </Directory>
</FileListing>"#
        );
        assert_eq!(FileList::parse(&xml).unwrap(), list);
    }

    #[test]
    fn rejects_broken_documents() {
        assert!(FileList::parse("<Other/>").is_err());
        assert!(FileList::parse(r#"<FileListing><File Name="x"/></FileListing>"#).is_err());
    }
}
