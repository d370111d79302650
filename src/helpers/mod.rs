pub mod csv_helpers;
