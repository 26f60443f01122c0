mod device_view;
mod monitor_view;
mod painter;
mod response_view;
mod spinner;
mod table;

pub(crate) use self::device_view::{ConnectionView, DeviceListView};
pub(crate) use self::monitor_view::{MonitorSampleView, MonitorSummaryView};
pub(crate) use self::painter::Painter;
pub(crate) use self::response_view::CommandReportView;
pub(crate) use self::spinner::Spinner;
