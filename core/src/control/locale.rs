//! Localized error messages for control-protocol replies
//!
//! Messages carry up to three positional parameters (`%1`, `%2`, `%3`).
//! Locale resolution walks `xx_YY` -> `xx` -> `en`; log output always uses
//! `en`, only the client reply is localized.

use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LocalizationKey {
    ErrorAuthentication,
    ErrorOperation,
    ErrorLogLevel,
    ErrorMissingDeviceId,
    ErrorMissingFilename,
    ErrorDeviceMissingFilename,
    ErrorImageInUse,
    ErrorImageFileInfo,
    ErrorReservedId,
    ErrorNonExistingDevice,
    ErrorNonExistingUnit,
    ErrorUnknownDeviceType,
    ErrorMissingDeviceType,
    ErrorDuplicateId,
    ErrorDetach,
    ErrorEjectRequired,
    ErrorDeviceNameUpdate,
    ErrorShutdownModeMissing,
    ErrorShutdownModeInvalid,
    ErrorShutdownPermission,
    ErrorFileOpen,
    ErrorBlockSize,
    ErrorBlockSizeNotConfigurable,
    ErrorScsiController,
    ErrorInvalidId,
    ErrorInvalidLun,
    ErrorLun0,
    ErrorInitialization,
    ErrorOperationDeniedStoppable,
    ErrorOperationDeniedRemovable,
    ErrorOperationDeniedProtectable,
    ErrorOperationDeniedReady,
}

use LocalizationKey::*;

pub struct Localizer {
    messages: HashMap<&'static str, HashMap<LocalizationKey, &'static str>>,
}

impl Default for Localizer {
    fn default() -> Self {
        Self::new()
    }
}

impl Localizer {
    pub fn new() -> Self {
        let mut messages = HashMap::new();

        messages.insert(
            "en",
            HashMap::from([
                (ErrorAuthentication, "Authentication failed"),
                (ErrorOperation, "Unknown operation"),
                (ErrorLogLevel, "Invalid log level '%1'"),
                (ErrorMissingDeviceId, "Missing device ID"),
                (ErrorMissingFilename, "Missing filename"),
                (ErrorDeviceMissingFilename, "Device type %1 requires a filename"),
                (
                    ErrorImageInUse,
                    "Image file '%1' is already being used by ID %2, unit %3",
                ),
                (ErrorImageFileInfo, "Can't get image file info for '%1'"),
                (ErrorReservedId, "Device ID %1 is reserved"),
                (ErrorNonExistingDevice, "Command for non-existing ID %1"),
                (ErrorNonExistingUnit, "Command for non-existing ID %1, unit %2"),
                (ErrorUnknownDeviceType, "Unknown device type %1"),
                (
                    ErrorMissingDeviceType,
                    "Device type required for unknown extension of file '%1'",
                ),
                (ErrorDuplicateId, "Duplicate ID %1, unit %2"),
                (ErrorDetach, "Couldn't detach device"),
                (ErrorEjectRequired, "Existing medium must first be ejected"),
                (
                    ErrorDeviceNameUpdate,
                    "Once set the device name cannot be changed anymore",
                ),
                (ErrorShutdownModeMissing, "Missing shutdown mode"),
                (ErrorShutdownModeInvalid, "Invalid shutdown mode '%1'"),
                (
                    ErrorShutdownPermission,
                    "Missing root permission for shutdown or reboot",
                ),
                (ErrorFileOpen, "Invalid or non-existing file '%1'"),
                (ErrorBlockSize, "Invalid block size %1 bytes"),
                (
                    ErrorBlockSizeNotConfigurable,
                    "Block size for device type %1 is not configurable",
                ),
                (ErrorScsiController, "Couldn't create SCSI controller"),
                (ErrorInvalidId, "Invalid device ID %1 (0-%2)"),
                (ErrorInvalidLun, "Invalid LUN %1 (0-%2)"),
                (
                    ErrorLun0,
                    "LUN 0 cannot be detached as long as there is still another LUN",
                ),
                (
                    ErrorInitialization,
                    "Initialization of %1 device, ID %2, LUN %3 failed",
                ),
                (
                    ErrorOperationDeniedStoppable,
                    "%1 operation denied, %2 isn't stoppable",
                ),
                (
                    ErrorOperationDeniedRemovable,
                    "%1 operation denied, %2 isn't removable",
                ),
                (
                    ErrorOperationDeniedProtectable,
                    "%1 operation denied, %2 isn't protectable",
                ),
                (
                    ErrorOperationDeniedReady,
                    "%1 operation denied, %2 isn't ready",
                ),
            ]),
        );

        messages.insert(
            "de",
            HashMap::from([
                (ErrorAuthentication, "Authentifizierung fehlgeschlagen"),
                (ErrorOperation, "Unbekannte Operation"),
                (ErrorLogLevel, "Ungültiger Log-Level '%1'"),
                (ErrorMissingDeviceId, "Fehlende Geräte-ID"),
                (ErrorMissingFilename, "Fehlender Dateiname"),
                (ErrorDeviceMissingFilename, "Gerätetyp %1 benötigt einen Dateinamen"),
                (
                    ErrorImageInUse,
                    "Image-Datei '%1' wird bereits von ID %2, Einheit %3 benutzt",
                ),
                (
                    ErrorImageFileInfo,
                    "Image-Datei-Informationen für '%1' können nicht ermittelt werden",
                ),
                (ErrorReservedId, "Geräte-ID %1 ist reserviert"),
                (ErrorNonExistingDevice, "Kommando für nicht existente ID %1"),
                (
                    ErrorNonExistingUnit,
                    "Kommando für nicht existente ID %1, Einheit %2",
                ),
                (ErrorUnknownDeviceType, "Unbekannter Gerätetyp %1"),
                (
                    ErrorMissingDeviceType,
                    "Gerätetyp benötigt für unbekannte Erweiterung der Datei '%1'",
                ),
                (ErrorDuplicateId, "Doppelte ID %1, Einheit %2"),
                (ErrorDetach, "Gerät konnte nicht entfernt werden"),
                (
                    ErrorEjectRequired,
                    "Das vorhandene Medium muss erst ausgeworfen werden",
                ),
                (
                    ErrorDeviceNameUpdate,
                    "Ein einmal gesetzter Gerätename kann nicht mehr geändert werden",
                ),
                (ErrorShutdownModeMissing, "Fehlender Shutdown-Modus"),
                (ErrorShutdownModeInvalid, "Ungültiger Shutdown-Modus '%1'"),
                (
                    ErrorShutdownPermission,
                    "Fehlende Root-Berechtigung für Shutdown oder Neustart",
                ),
                (ErrorFileOpen, "Ungültige oder fehlende Datei '%1'"),
                (ErrorBlockSize, "Ungültige Blockgröße %1 Bytes"),
                (
                    ErrorBlockSizeNotConfigurable,
                    "Die Blockgröße für Gerätetyp %1 ist nicht konfigurierbar",
                ),
                (
                    ErrorScsiController,
                    "SCSI-Controller konnte nicht erzeugt werden",
                ),
                (ErrorInvalidId, "Ungültige Geräte-ID %1 (0-%2)"),
                (ErrorInvalidLun, "Ungültige LUN %1 (0-%2)"),
                (
                    ErrorLun0,
                    "LUN 0 kann nicht entfernt werden, solange noch eine andere LUN existiert",
                ),
                (
                    ErrorInitialization,
                    "Initialisierung von %1-Gerät, ID %2, LUN %3 fehlgeschlagen",
                ),
                (
                    ErrorOperationDeniedStoppable,
                    "%1-Operation verweigert, %2 ist nicht stopbar",
                ),
                (
                    ErrorOperationDeniedRemovable,
                    "%1-Operation verweigert, %2 ist nicht wechselbar",
                ),
                (
                    ErrorOperationDeniedProtectable,
                    "%1-Operation verweigert, %2 ist nicht schützbar",
                ),
                (
                    ErrorOperationDeniedReady,
                    "%1-Operation verweigert, %2 ist nicht bereit",
                ),
            ]),
        );

        messages.insert(
            "fr",
            HashMap::from([
                (ErrorAuthentication, "Echec de l'authentification"),
                (ErrorOperation, "Opération inconnue"),
                (ErrorMissingFilename, "Nom de fichier manquant"),
                (
                    ErrorImageInUse,
                    "Le fichier image '%1' est déjà utilisé par l'ID %2, unité %3",
                ),
                (ErrorReservedId, "L'ID de périphérique %1 est réservé"),
                (ErrorUnknownDeviceType, "Type de périphérique inconnu %1"),
                (ErrorDuplicateId, "ID %1, unité %2 dupliquée"),
                (ErrorFileOpen, "Fichier invalide ou inexistant '%1'"),
                (ErrorBlockSize, "Taille de bloc invalide %1 octets"),
            ]),
        );

        messages.insert(
            "es",
            HashMap::from([
                (ErrorAuthentication, "Fallo de autenticación"),
                (ErrorOperation, "Operación desconocida"),
                (ErrorMissingFilename, "Falta el nombre del archivo"),
                (
                    ErrorImageInUse,
                    "El archivo de imagen '%1' ya está siendo utilizado por el ID %2, unidad %3",
                ),
                (ErrorReservedId, "El ID de dispositivo %1 está reservado"),
                (ErrorUnknownDeviceType, "Tipo de dispositivo desconocido %1"),
                (ErrorDuplicateId, "ID duplicado %1, unidad %2"),
                (ErrorFileOpen, "Archivo inválido o inexistente '%1'"),
                (ErrorBlockSize, "Tamaño de bloque inválido %1 bytes"),
            ]),
        );

        messages.insert(
            "sv",
            HashMap::from([
                (ErrorAuthentication, "Autentisering misslyckades"),
                (ErrorOperation, "Okänd operation"),
                (ErrorMissingFilename, "Filnamn saknas"),
                (
                    ErrorImageInUse,
                    "Skivbildsfilen '%1' används redan av ID %2, enhet %3",
                ),
                (ErrorReservedId, "Enhets-ID %1 är reserverat"),
                (ErrorUnknownDeviceType, "Okänd enhetstyp %1"),
                (ErrorDuplicateId, "Duplikat ID %1, enhet %2"),
                (ErrorFileOpen, "Ogiltig eller saknad fil '%1'"),
                (ErrorBlockSize, "Ogiltig blockstorlek %1 byte"),
            ]),
        );

        Self { messages }
    }

    /// Localizes a message with up to three positional arguments
    pub fn localize(&self, key: LocalizationKey, locale: &str, args: &[&str]) -> String {
        let locale = locale.to_ascii_lowercase();

        // xx_YY -> xx -> en
        let catalog = self
            .messages
            .get(locale.as_str())
            .or_else(|| {
                locale
                    .split(['_', '-', '.'])
                    .next()
                    .and_then(|language| self.messages.get(language))
            })
            .unwrap_or_else(|| &self.messages["en"]);

        let template = catalog
            .get(&key)
            .or_else(|| self.messages["en"].get(&key))
            .copied()
            .unwrap_or("Unknown error");

        let mut message = template.to_string();
        for (i, arg) in args.iter().enumerate().take(3) {
            message = message.replace(&format!("%{}", i + 1), arg);
        }

        message
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn substitutes_positional_arguments() {
        let localizer = Localizer::new();
        let msg = localizer.localize(ErrorImageInUse, "en", &["test.hds", "1", "2"]);
        assert_eq!(
            msg,
            "Image file 'test.hds' is already being used by ID 1, unit 2"
        );
    }

    #[test]
    fn falls_back_from_region_to_language() {
        let localizer = Localizer::new();
        let msg = localizer.localize(ErrorOperation, "de_DE", &[]);
        assert_eq!(msg, "Unbekannte Operation");
    }

    #[test]
    fn falls_back_to_english_for_unknown_locale() {
        let localizer = Localizer::new();
        let msg = localizer.localize(ErrorOperation, "ja_JP", &[]);
        assert_eq!(msg, "Unknown operation");
    }

    #[test]
    fn falls_back_to_english_for_missing_key() {
        let localizer = Localizer::new();
        // French only carries a subset
        let msg = localizer.localize(ErrorLun0, "fr", &[]);
        assert!(msg.starts_with("LUN 0"));
    }
}
